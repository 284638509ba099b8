//! Terminal state: the typed-input byte queue and the single in-flight
//! transmit per terminal. Hardware interaction and the blocking protocol
//! live in the trap and syscall layers.

use alloc::vec::Vec;

use crossbeam_queue::ArrayQueue;

use crate::hardware::{TERMINAL_MAX_LINE, TTY_BUFFER_SIZE};
use crate::process::{Pid, ProcQueue};

/// One write in flight on a terminal, transmitted a hardware-sized chunk
/// at a time.
#[derive(Debug)]
pub struct TtyTransmit {
    pub pid: Pid,
    data: Vec<u8>,
    sent: usize,
}

impl TtyTransmit {
    pub fn new(pid: Pid, data: Vec<u8>) -> Self {
        TtyTransmit { pid, data, sent: 0 }
    }

    /// The next chunk to hand to the hardware.
    pub fn chunk(&self) -> &[u8] {
        let end = core::cmp::min(self.sent + TERMINAL_MAX_LINE, self.data.len());
        &self.data[self.sent..end]
    }

    /// Mark the current chunk done. Returns true when the whole write is
    /// finished.
    pub fn advance(&mut self) -> bool {
        self.sent = core::cmp::min(self.sent + TERMINAL_MAX_LINE, self.data.len());
        self.sent >= self.data.len()
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }
}

pub struct Tty {
    pub id: usize,
    input: ArrayQueue<u8>,
    pub read_waiters: ProcQueue,
    pub write_waiters: ProcQueue,
    /// The writer whose data is on the wire right now. Later writers
    /// queue behind it on `write_waiters`.
    pub active: Option<TtyTransmit>,
}

impl Tty {
    pub fn new(id: usize) -> Self {
        Tty {
            id,
            input: ArrayQueue::new(TTY_BUFFER_SIZE),
            read_waiters: ProcQueue::new(),
            write_waiters: ProcQueue::new(),
            active: None,
        }
    }

    /// Buffer typed bytes. Input past the buffer's capacity is dropped,
    /// as real serial hardware drops it. Returns how many were kept.
    pub fn push_input(&self, bytes: &[u8]) -> usize {
        let mut n = 0;
        for &b in bytes {
            if self.input.push(b).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// Drain up to `out.len()` buffered input bytes.
    pub fn read_input(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.input.pop() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

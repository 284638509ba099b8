//! Pipes: bounded byte channels between processes. This module holds the
//! buffer and waiter state; the blocking protocol (who sleeps, who wakes)
//! is driven from the syscall layer.

use crossbeam_queue::ArrayQueue;

use crate::hardware::PIPE_BUFFER_LEN;
use crate::process::ProcQueue;
use crate::ResourceId;

pub struct Pipe {
    pub id: ResourceId,
    buf: ArrayQueue<u8>,
    pub read_waiters: ProcQueue,
    pub write_waiters: ProcQueue,
}

impl Pipe {
    pub fn new(id: ResourceId) -> Self {
        Pipe {
            id,
            buf: ArrayQueue::new(PIPE_BUFFER_LEN),
            read_waiters: ProcQueue::new(),
            write_waiters: ProcQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Drain up to `out.len()` bytes. Returns how many were taken; zero
    /// only when the buffer is empty.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.buf.pop() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Append bytes until the buffer fills. Returns how many fit.
    pub fn write_from(&self, data: &[u8]) -> usize {
        let mut n = 0;
        for &b in data {
            if self.buf.push(b).is_err() {
                break;
            }
            n += 1;
        }
        n
    }
}

//! FIFO queues of process handles. Every wait point in the kernel (ready
//! list, lock waiters, cvar waiters, pipe and terminal queues) is one of
//! these; a process is found by pid, never by an embedded link.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::process::pcb::Pid;

/// Strict FIFO queue of pids. A pid may sit on at most one queue at a
/// time; the owning PCB's queue tag records which.
#[derive(Debug, Default)]
pub struct ProcQueue {
    inner: VecDeque<Pid>,
}

impl ProcQueue {
    pub fn new() -> Self {
        ProcQueue {
            inner: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, pid: Pid) {
        self.inner.push_back(pid);
    }

    pub fn pop_front(&mut self) -> Option<Pid> {
        self.inner.pop_front()
    }

    /// Remove a pid from anywhere in the queue. Returns whether it was
    /// present. Used when a process dies while blocked.
    pub fn remove(&mut self, pid: Pid) -> bool {
        if let Some(pos) = self.inner.iter().position(|&p| p == pid) {
            self.inner.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.inner.iter().copied()
    }
}

/// The set of delayed processes. Order does not matter; every clock tick
/// visits all of them.
#[derive(Debug, Default)]
pub struct DelaySet {
    members: Vec<Pid>,
}

impl DelaySet {
    pub fn new() -> Self {
        DelaySet {
            members: Vec::new(),
        }
    }

    pub fn insert(&mut self, pid: Pid) {
        self.members.push(pid);
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        if let Some(pos) = self.members.iter().position(|&p| p == pid) {
            self.members.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Drain the members into `f`; retain those for which `f` returns
    /// false (still delayed), release the rest.
    pub fn expire<F: FnMut(Pid) -> bool>(&mut self, mut f: F) -> Vec<Pid> {
        let mut expired = Vec::new();
        self.members.retain(|&pid| {
            if f(pid) {
                expired.push(pid);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.members.contains(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

//! Kernel-level locks and Mesa-style condition variables. These hold the
//! pure ownership and queueing state; blocking and waking the processes
//! themselves is the kernel's job.

use core::fmt;

use crate::process::{Pid, ProcQueue};
use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Release or cvar-wait by a process that does not hold the lock.
    NotOwner { lock: ResourceId, pid: Pid },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotOwner { lock, pid } => {
                write!(f, "process {} does not hold lock {}", pid, lock)
            }
        }
    }
}

/// What to do with blocked waiters when their lock, cvar, or pipe is
/// reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Waiters are killed along with the resource.
    KillWaiters,
    /// Waiters are woken with an error result.
    ReleaseWaiters,
}

#[derive(Debug)]
pub enum AcquireOutcome {
    /// The caller now holds the lock (or already held it; a repeat
    /// acquire by the owner succeeds immediately).
    Acquired,
    /// Held by someone else; the caller must block.
    MustWait,
}

#[derive(Debug, Default)]
pub struct Lock {
    pub id: ResourceId,
    owner: Option<Pid>,
    pub waiters: ProcQueue,
}

impl Lock {
    pub fn new(id: ResourceId) -> Self {
        Lock {
            id,
            owner: None,
            waiters: ProcQueue::new(),
        }
    }

    pub fn owner(&self) -> Option<Pid> {
        self.owner
    }

    pub fn try_acquire(&mut self, pid: Pid) -> AcquireOutcome {
        match self.owner {
            None => {
                self.owner = Some(pid);
                AcquireOutcome::Acquired
            }
            Some(holder) if holder == pid => AcquireOutcome::Acquired,
            Some(_) => AcquireOutcome::MustWait,
        }
    }

    /// Release the lock. If anyone is waiting, the head of the queue
    /// becomes the owner before it even runs again, so the lock can never
    /// be stolen out from under a woken waiter. Returns the new owner.
    pub fn release(&mut self, pid: Pid) -> Result<Option<Pid>, SyncError> {
        if self.owner != Some(pid) {
            return Err(SyncError::NotOwner { lock: self.id, pid });
        }
        match self.waiters.pop_front() {
            Some(next) => {
                self.owner = Some(next);
                Ok(Some(next))
            }
            None => {
                self.owner = None;
                Ok(None)
            }
        }
    }

    /// Forced release on reclaim or owner death; ownership just clears.
    pub fn clear_owner(&mut self) {
        self.owner = None;
    }
}

#[derive(Debug, Default)]
pub struct Cvar {
    pub id: ResourceId,
    pub waiters: ProcQueue,
}

impl Cvar {
    pub fn new(id: ResourceId) -> Self {
        Cvar {
            id,
            waiters: ProcQueue::new(),
        }
    }

    /// Wake one waiter, if any. Mesa semantics: the woken process must
    /// recheck its condition after it reacquires the lock.
    pub fn signal(&mut self) -> Option<Pid> {
        self.waiters.pop_front()
    }

    pub fn broadcast(&mut self) -> alloc::vec::Vec<Pid> {
        let mut woken = alloc::vec::Vec::with_capacity(self.waiters.len());
        while let Some(pid) = self.waiters.pop_front() {
            woken.push(pid);
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_reentrant_for_the_owner() {
        let mut l = Lock::new(1);
        assert!(matches!(l.try_acquire(7), AcquireOutcome::Acquired));
        assert!(matches!(l.try_acquire(7), AcquireOutcome::Acquired));
        assert!(matches!(l.try_acquire(8), AcquireOutcome::MustWait));
    }

    #[test]
    fn release_hands_ownership_to_head_waiter() {
        let mut l = Lock::new(1);
        l.try_acquire(1);
        l.waiters.push_back(2);
        l.waiters.push_back(3);
        assert_eq!(l.release(1), Ok(Some(2)));
        // Pid 3 still cannot take it even though 2 has not run yet.
        assert!(matches!(l.try_acquire(3), AcquireOutcome::MustWait));
        assert_eq!(l.owner(), Some(2));
        assert_eq!(l.release(2), Ok(Some(3)));
        assert_eq!(l.release(3), Ok(None));
        assert_eq!(l.owner(), None);
    }

    #[test]
    fn release_by_non_owner_is_an_error() {
        let mut l = Lock::new(9);
        l.try_acquire(1);
        assert_eq!(l.release(2), Err(SyncError::NotOwner { lock: 9, pid: 2 }));
        assert_eq!(l.owner(), Some(1));
        let mut free = Lock::new(10);
        assert!(free.release(1).is_err());
    }

    #[test]
    fn cvar_signal_wakes_in_fifo_order() {
        let mut c = Cvar::new(4);
        c.waiters.push_back(5);
        c.waiters.push_back(6);
        assert_eq!(c.signal(), Some(5));
        assert_eq!(c.signal(), Some(6));
        assert_eq!(c.signal(), None);
    }

    #[test]
    fn cvar_broadcast_drains_all_waiters() {
        let mut c = Cvar::new(4);
        for pid in [1, 2, 3] {
            c.waiters.push_back(pid);
        }
        assert_eq!(c.broadcast(), alloc::vec![1, 2, 3]);
        assert!(c.waiters.is_empty());
    }
}

//! Round-robin scheduling over the ready queue, with the idle process as
//! the fallback when nothing is runnable.

use crate::hardware::{Machine, Region, KERNEL_STACK_PAGES};
use crate::memory::frame_table::FrameTable;
use crate::memory::page_table::{PageTable, PageTableEntry};
use crate::process::context::{self, SwitchError};
use crate::process::pcb::{Pid, ProcessTable, QueueTag};
use crate::process::queue::{DelaySet, ProcQueue};
use crate::trace_printf;

/// What to do with the process being switched away from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Preempted: goes to the back of the ready queue.
    Requeue,
    /// Blocked: the caller has already put it on a wait queue.
    Block,
    /// Dying: its kernel stack is freed on the way out. The PCB is kept
    /// as a zombie only if a parent may still Wait for it.
    Delete { keep_zombie: bool },
}

pub struct Scheduler {
    pub ready: ProcQueue,
    pub delay: DelaySet,
    idle: Pid,
    running: Pid,
}

impl Scheduler {
    /// At boot the idle process is the running process.
    pub fn new(idle: Pid) -> Self {
        Scheduler {
            ready: ProcQueue::new(),
            delay: DelaySet::new(),
            idle,
            running: idle,
        }
    }

    pub fn running(&self) -> Pid {
        self.running
    }

    pub fn idle(&self) -> Pid {
        self.idle
    }

    /// Put a process on the back of the ready queue. The idle process
    /// never sits there; it is always reachable as the fallback.
    pub fn make_ready(&mut self, procs: &mut ProcessTable, pid: Pid) {
        if pid == self.idle {
            return;
        }
        if let Some(pcb) = procs.get_mut(pid) {
            pcb.queue = QueueTag::Ready;
        }
        self.ready.push_back(pid);
    }

    /// Switch away from the running process per `disposition` and install
    /// the head of the ready queue (or idle). Returns the new running pid.
    ///
    /// The next process is chosen before the outgoing one is requeued, so
    /// a preempted process never immediately reinstalls itself while
    /// others wait.
    pub fn install_next(
        &mut self,
        procs: &mut ProcessTable,
        machine: &mut Machine,
        region0: &mut PageTable,
        frame_table: &mut FrameTable,
        disposition: Disposition,
    ) -> Result<Pid, SwitchError> {
        let outgoing = self.running;
        let next = self.ready.pop_front().unwrap_or(self.idle);
        if next == outgoing {
            // Only reachable when requeueing with an empty ready queue.
            return Ok(outgoing);
        }

        if disposition == Disposition::Requeue {
            self.make_ready(procs, outgoing);
        }

        // New address space: point the MMU at the next process's table
        // and drop every cached region-1 translation.
        machine.set_ptbr1(next);
        machine.tlb().flush_region(Region::One);

        let mut inc = procs
            .remove(next)
            .ok_or(SwitchError::UnknownProcess(next))?;
        inc.queue = QueueTag::None;

        let result = match disposition {
            Disposition::Delete { keep_zombie } => {
                let out = procs.remove(outgoing);
                let r = context::switch_delete(machine, region0, frame_table, &mut inc);
                if let Some(mut out) = out {
                    out.kernel_stack = [PageTableEntry::INVALID; KERNEL_STACK_PAGES];
                    if keep_zombie {
                        procs.insert(out);
                    } else {
                        trace_printf!(2, "reaped process {} on exit", out.pid);
                    }
                }
                r
            }
            Disposition::Requeue | Disposition::Block => {
                let mut out = procs
                    .remove(outgoing)
                    .ok_or(SwitchError::UnknownProcess(outgoing))?;
                let r = context::switch(machine, region0, &mut out, &mut inc);
                procs.insert(out);
                r
            }
        };
        procs.insert(inc);
        self.running = next;
        result.map(|_| next)
    }
}

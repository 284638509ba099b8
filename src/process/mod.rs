//! Processes: control blocks and the pid-indexed process table, wait
//! queues, the kernel-context switch engine, and the round-robin
//! scheduler.

pub mod context;
pub mod pcb;
pub mod queue;
pub mod scheduler;

pub use context::{Cloned, SwitchError};
pub use pcb::{PendingSyscall, Pid, ProcessControlBlock, ProcessError, ProcessTable, QueueTag};
pub use queue::{DelaySet, ProcQueue};
pub use scheduler::{Disposition, Scheduler};

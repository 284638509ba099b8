//! rynix, a Yalnix-style teaching kernel.
//!
//! The kernel multiplexes sequential user processes over a simulated machine
//! ([`hardware::Machine`]): paged virtual memory split into a kernel region
//! (region 0) and a per-process user region (region 1), preemptive
//! round-robin scheduling driven by a timer trap, and a syscall surface for
//! process control (fork/exec/exit/wait), synchronization (locks, condition
//! variables) and IPC (pipes, terminals).
//!
//! There is a single hardware thread of execution; "concurrency" is
//! cooperative, interrupt-driven multiplexing. Kernel data structures are
//! mutated without internal locking, so no handler may reach a suspension
//! point (a context switch) while a structure is transiently inconsistent.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod hardware;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscalls;
pub mod trace;
pub mod traps;
pub mod tty;

pub use hardware::{
    KernelContext, Machine, UserContext, KERNEL_STACK_PAGES, PAGE_SHIFT, PAGE_SIZE,
    PIPE_BUFFER_LEN, TERMINAL_MAX_LINE, TTY_COUNT, VMEM_0_BASE, VMEM_0_SIZE, VMEM_1_BASE,
    VMEM_1_LIMIT, VMEM_1_SIZE,
};
pub use kernel::{Kernel, KernelConfig};
pub use process::pcb::Pid;
pub use syscalls::SyscallOutcome;

/// Identifier for a kernel synchronization/IPC resource (lock, cvar or pipe).
/// All three kinds share one id space so `Reclaim(id)` can dispatch by id.
pub type ResourceId = u32;

/// The fixed sentinel returned to userland for any failed syscall.
pub const ERROR: isize = -1;

/// Conventional success return for syscalls with no payload.
pub const SUCCESS: isize = 0;

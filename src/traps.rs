//! Trap handlers: the clock interrupt, user faults, terminal interrupts,
//! and the syscall dispatch that connects user traps to the handlers in
//! [`crate::syscalls`].

use crate::hardware::TTY_COUNT;
use crate::kernel::{Kernel, KernelError, KILLED};
use crate::memory::address_space::{self, AddressSpaceError};
use crate::process::context::SwitchError;
use crate::process::Disposition;
use crate::syscalls::SyscallOutcome;
use crate::trace_printf;
use crate::ResourceId;

/// A decoded user trap into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork,
    Exec { name_addr: usize, argv_addr: usize },
    Exit { code: i32 },
    Wait { status_addr: usize },
    GetPid,
    Brk { addr: usize },
    Delay { ticks: isize },
    LockInit,
    Acquire { lock: ResourceId },
    Release { lock: ResourceId },
    CvarInit,
    CvarSignal { cvar: ResourceId },
    CvarBroadcast { cvar: ResourceId },
    CvarWait { cvar: ResourceId, lock: ResourceId },
    PipeInit,
    PipeRead { pipe: ResourceId, addr: usize, len: usize },
    PipeWrite { pipe: ResourceId, addr: usize, len: usize },
    TtyRead { tty: usize, addr: usize, len: usize },
    TtyWrite { tty: usize, addr: usize, len: usize },
    Reclaim { id: ResourceId },
}

impl Kernel {
    /// Dispatch a syscall trap. Immediate results land in the live user
    /// context's return register; blocked calls get theirs on wake.
    pub fn on_syscall(&mut self, call: Syscall) -> Result<(), KernelError> {
        let outcome = match call {
            Syscall::Fork => self.handle_fork()?,
            Syscall::Exec { name_addr, argv_addr } => self.handle_exec(name_addr, argv_addr)?,
            Syscall::Exit { code } => {
                self.handle_exit(code)?;
                return Ok(());
            }
            Syscall::Wait { status_addr } => self.handle_wait(status_addr)?,
            Syscall::GetPid => self.handle_getpid()?,
            Syscall::Brk { addr } => self.handle_brk(addr)?,
            Syscall::Delay { ticks } => self.handle_delay(ticks)?,
            Syscall::LockInit => self.handle_lock_init()?,
            Syscall::Acquire { lock } => self.handle_acquire(lock)?,
            Syscall::Release { lock } => self.handle_release(lock)?,
            Syscall::CvarInit => self.handle_cvar_init()?,
            Syscall::CvarSignal { cvar } => self.handle_cvar_signal(cvar)?,
            Syscall::CvarBroadcast { cvar } => self.handle_cvar_broadcast(cvar)?,
            Syscall::CvarWait { cvar, lock } => self.handle_cvar_wait(cvar, lock)?,
            Syscall::PipeInit => self.handle_pipe_init()?,
            Syscall::PipeRead { pipe, addr, len } => self.handle_pipe_read(pipe, addr, len)?,
            Syscall::PipeWrite { pipe, addr, len } => self.handle_pipe_write(pipe, addr, len)?,
            Syscall::TtyRead { tty, addr, len } => self.handle_tty_read(tty, addr, len)?,
            Syscall::TtyWrite { tty, addr, len } => self.handle_tty_write(tty, addr, len)?,
            Syscall::Reclaim { id } => self.handle_reclaim(id)?,
        };
        if let SyscallOutcome::Complete(v) = outcome {
            self.machine.live_user_context_mut().regs[0] = v;
        }
        Ok(())
    }

    /// The clock tick: credit delayed processes, then round-robin.
    /// Expired sleepers reach the ready queue before the preempted
    /// process does, so they run first.
    pub fn on_clock(&mut self) -> Result<(), KernelError> {
        let expired = {
            let procs = &mut self.procs;
            self.sched.delay.expire(|pid| match procs.get_mut(pid) {
                Some(p) if p.delay_ticks > 1 => {
                    p.delay_ticks -= 1;
                    false
                }
                _ => true,
            })
        };
        for pid in expired {
            self.wake(pid);
        }
        self.sched.install_next(
            &mut self.procs,
            &mut self.machine,
            &mut self.region0,
            &mut self.frame_table,
            Disposition::Requeue,
        )?;
        Ok(())
    }

    /// A region-1 memory fault: implicit stack growth if the address is
    /// in the guard window below the stack, fatal otherwise.
    pub fn on_memory_fault(&mut self, addr: usize) -> Result<(), KernelError> {
        let cur = self.sched.running();
        let guard = self.config.stack_guard_pages;
        let result = {
            let pcb = self
                .procs
                .get_mut(cur)
                .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))?;
            let brk = pcb.brk_page;
            match pcb.region1.as_mut() {
                Some(table) => address_space::handle_stack_fault(
                    &mut self.frame_table,
                    table,
                    brk,
                    addr,
                    guard,
                ),
                None => Err(AddressSpaceError::NotStackGrowth(addr)),
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                trace_printf!(0, "MEMORY FAULT: pid {} at {:#x} ({:?}), killed", cur, addr, e);
                self.handle_exit(KILLED)
            }
        }
    }

    /// Illegal instruction: fatal to the process.
    pub fn on_illegal(&mut self, code: usize) -> Result<(), KernelError> {
        let cur = self.sched.running();
        trace_printf!(0, "ILLEGAL: pid {} code {:#x}, killed", cur, code);
        self.handle_exit(KILLED)
    }

    /// Arithmetic fault: fatal to the process.
    pub fn on_math(&mut self) -> Result<(), KernelError> {
        let cur = self.sched.running();
        trace_printf!(0, "MATH: pid {}, killed", cur);
        self.handle_exit(KILLED)
    }

    /// A line arrived on a terminal: buffer it and wake one reader.
    pub fn on_tty_receive(&mut self, tty_id: usize) -> Result<(), KernelError> {
        if tty_id >= TTY_COUNT {
            return Ok(());
        }
        if let Some(line) = self.machine.tty_take_line(tty_id) {
            let kept = self.ttys[tty_id].push_input(&line);
            trace_printf!(2, "TTY {}: received {} bytes ({} buffered)", tty_id, line.len(), kept);
            if kept > 0 {
                if let Some(reader) = self.ttys[tty_id].read_waiters.pop_front() {
                    self.wake(reader);
                }
            }
        }
        Ok(())
    }

    /// A transmit chunk finished: send the next chunk, or complete the
    /// writer and promote the next queued one.
    pub fn on_tty_transmit(&mut self, tty_id: usize) -> Result<(), KernelError> {
        if tty_id >= TTY_COUNT {
            return Ok(());
        }
        if self.machine.tty_transmit_busy(tty_id) {
            self.machine.tty_finish_transmit(tty_id)?;
        }
        let done = match self.ttys[tty_id].active.as_mut() {
            None => return Ok(()),
            Some(t) => t.advance(),
        };
        if !done {
            let chunk = self.ttys[tty_id]
                .active
                .as_ref()
                .map(|t| t.chunk().to_vec())
                .unwrap_or_default();
            self.machine.tty_transmit(tty_id, &chunk)?;
            return Ok(());
        }
        if let Some(finished) = self.ttys[tty_id].active.take() {
            self.wake(finished.pid);
        }
        if let Some(next) = self.ttys[tty_id].write_waiters.pop_front() {
            self.start_tty_transmit(tty_id, next)?;
        }
        Ok(())
    }
}

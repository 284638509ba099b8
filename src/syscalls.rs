//! Syscall handlers. Each runs on behalf of the current process and
//! either finishes immediately with a result or blocks: the process goes
//! onto a wait queue with a [`PendingSyscall`] continuation, and the
//! kernel switches to the next runnable process. The result of a blocked
//! call is deposited by [`Kernel::wake`] when the wait is over.

use alloc::string::String;
use alloc::vec::Vec;

use crate::hardware::TTY_COUNT;
use crate::ipc::Pipe;
use crate::kernel::{copy_from_user, copy_to_user, Kernel, KernelError, ResourceKind, KILLED};
use crate::memory::address_space;
use crate::memory::check;
use crate::memory::Protection;
use crate::process::context::{self, Cloned, SwitchError};
use crate::process::pcb::PendingSyscall;
use crate::process::{Disposition, ProcessControlBlock, QueueTag};
use crate::sync::{AcquireOutcome, Cvar, Lock, ReclaimPolicy};
use crate::trace_printf;
use crate::{ResourceId, ERROR};

const MAX_ARGS: usize = 32;
const MAX_ARG_LEN: usize = 255;

/// How a syscall handler came out. `Blocked` means no result is
/// available yet (or, for a successful exec, that there is no caller to
/// return to); the trap layer must not touch the user's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    Complete(isize),
    Blocked,
}

use SyscallOutcome::{Blocked, Complete};

impl Kernel {
    fn current_pcb(&self) -> Result<&ProcessControlBlock, KernelError> {
        let cur = self.sched.running();
        self.procs
            .get(cur)
            .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))
    }

    /// Fork the current process: duplicate its region 1 and kernel stack
    /// into fresh frames. All frames are pre-checked; a fork that cannot
    /// complete changes nothing and returns `ERROR`.
    pub fn handle_fork(&mut self) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let needed = match self.current_pcb()?.region1.as_ref() {
            Some(t) => t.count_valid() + crate::hardware::KERNEL_STACK_PAGES,
            None => return Ok(Complete(ERROR)),
        };
        if self.frame_table.count_free() < needed {
            trace_printf!(1, "FORK: pid {} needs {} frames, refused", cur, needed);
            return Ok(Complete(ERROR));
        }
        let child_pid = match self.procs.alloc_pid() {
            Ok(p) => p,
            Err(_) => return Ok(Complete(ERROR)),
        };

        let child_table = {
            let src = self
                .procs
                .get(cur)
                .and_then(|p| p.region1.as_ref())
                .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))?;
            match address_space::fork_copy(
                &mut self.machine,
                &mut self.region0,
                &mut self.frame_table,
                src,
            ) {
                Ok(t) => t,
                Err(_) => return Ok(Complete(ERROR)),
            }
        };

        let mut child = ProcessControlBlock::new(child_pid, Some(cur));
        if context::copy_for_fork(
            &mut self.machine,
            &mut self.region0,
            &mut self.frame_table,
            &mut child,
        )
        .is_err()
        {
            address_space::teardown(&mut self.frame_table, &mut self.machine, Some(child_table));
            return Ok(Complete(ERROR));
        }
        child.region1 = Some(child_table);
        child.user_context = self.machine.live_user_context().clone();
        child.user_context.regs[0] = Cloned::Child.return_value();
        {
            let parent = self.current_pcb()?;
            child.brk_page = parent.brk_page;
            child.brk_floor_page = parent.brk_floor_page;
        }
        if let Some(parent) = self.procs.get_mut(cur) {
            parent.children.push(child_pid);
        }
        self.procs.insert(child);
        self.sched.make_ready(&mut self.procs, child_pid);
        trace_printf!(1, "FORK: pid {} -> child {}", cur, child_pid);
        Ok(Complete(Cloned::Parent(child_pid).return_value()))
    }

    /// Replace the current process's address space with a fresh program
    /// image. Arguments are validated before the old space is destroyed;
    /// once teardown starts, a load failure kills the process.
    pub fn handle_exec(
        &mut self,
        name_addr: usize,
        argv_addr: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let (name, args) = {
            let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) else {
                return Ok(Complete(ERROR));
            };
            let name = match check::read_string(&mut self.machine, table, name_addr, MAX_ARG_LEN) {
                Ok(n) => n,
                Err(e) => {
                    trace_printf!(1, "EXEC: pid {} bad name pointer: {}", cur, e);
                    return Ok(Complete(ERROR));
                }
            };
            let mut args: Vec<Vec<u8>> = Vec::new();
            if argv_addr != 0 {
                for i in 0..MAX_ARGS {
                    let mut word = [0u8; core::mem::size_of::<usize>()];
                    if copy_from_user(&self.machine, table, argv_addr + i * word.len(), &mut word)
                        .is_err()
                    {
                        return Ok(Complete(ERROR));
                    }
                    let ptr = usize::from_ne_bytes(word);
                    if ptr == 0 {
                        break;
                    }
                    match check::read_string(&mut self.machine, table, ptr, MAX_ARG_LEN) {
                        Ok(a) => args.push(a),
                        Err(_) => return Ok(Complete(ERROR)),
                    }
                }
            }
            (name, args)
        };
        let name = String::from_utf8_lossy(&name).into_owned();

        // Point of no return: the old image is gone.
        let old = self.procs.get_mut(cur).and_then(|p| p.region1.take());
        address_space::teardown(&mut self.frame_table, &mut self.machine, old);
        self.machine.tlb().flush_region(crate::hardware::Region::One);

        let load = {
            let pcb = self
                .procs
                .get_mut(cur)
                .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))?;
            self.loader
                .load(&mut self.machine, &mut self.frame_table, pcb, &name, &args)
        };
        match load {
            Ok(()) => {
                let ctx = self.current_pcb()?.user_context.clone();
                let result = ctx.regs[0];
                self.machine.set_live_user_context(ctx);
                trace_printf!(1, "EXEC: pid {} now running '{}'", cur, name);
                Ok(Complete(result))
            }
            Err(e) => {
                trace_printf!(0, "EXEC: pid {} load of '{}' failed ({}), killing", cur, name, e);
                self.handle_exit(KILLED)?;
                Ok(Blocked)
            }
        }
    }

    /// Exit the current process. Children are orphaned (and orphan
    /// zombies reaped); a live parent keeps a zombie to Wait on and is
    /// woken if it is already waiting. An exiting init halts the machine.
    pub fn handle_exit(&mut self, code: i32) -> Result<(), KernelError> {
        let cur = self.sched.running();
        trace_printf!(1, "EXIT: pid {} status {}", cur, code);
        if cur == self.init_pid() {
            self.halt();
            return Ok(());
        }
        let (parent, children, table) = {
            let pcb = self
                .procs
                .get_mut(cur)
                .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))?;
            pcb.has_exited = true;
            pcb.exit_code = code;
            pcb.pending = None;
            (
                pcb.parent,
                core::mem::take(&mut pcb.children),
                pcb.region1.take(),
            )
        };
        address_space::teardown(&mut self.frame_table, &mut self.machine, table);

        for child in children {
            let zombie = match self.procs.get_mut(child) {
                Some(c) => {
                    c.parent = None;
                    c.has_exited
                }
                None => false,
            };
            if zombie {
                // No one is left to Wait for it.
                self.procs.remove(child);
            }
        }

        let parent_alive = parent.map(|p| self.procs.contains(p)).unwrap_or(false);
        if parent_alive {
            let ppid = parent.unwrap_or_default();
            let waiting = self
                .procs
                .get(ppid)
                .map(|p| p.waiting_for_child_exit)
                .unwrap_or(false);
            if waiting {
                // Reaps our zombie and deposits the status.
                self.wake(ppid);
            }
        }
        self.sched.install_next(
            &mut self.procs,
            &mut self.machine,
            &mut self.region0,
            &mut self.frame_table,
            Disposition::Delete {
                keep_zombie: parent_alive,
            },
        )?;
        Ok(())
    }

    /// Collect one exited child: returns its pid and stores its status
    /// at `status_addr` (0 means the caller does not want the status).
    /// Blocks until a child exits; a process with no children gets
    /// `ERROR` immediately.
    pub fn handle_wait(&mut self, status_addr: usize) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let pcb = self.current_pcb()?;
        if pcb.children.is_empty() {
            return Ok(Complete(ERROR));
        }
        if status_addr != 0 {
            let ok = pcb
                .region1
                .as_ref()
                .map(|t| {
                    check::check_buffer(t, status_addr, 4, Protection::READ_WRITE).is_ok()
                })
                .unwrap_or(false);
            if !ok {
                return Ok(Complete(ERROR));
            }
        }
        if let Some(child) = pcb.exited_child(&self.procs) {
            let status = self.procs.remove(child).map(|z| z.exit_code).unwrap_or(KILLED);
            if let Some(p) = self.procs.get_mut(cur) {
                p.remove_child(child);
            }
            if status_addr != 0 {
                if let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) {
                    copy_to_user(&mut self.machine, table, status_addr, &status.to_ne_bytes())?;
                }
            }
            trace_printf!(2, "WAIT: pid {} reaped child {} (status {})", cur, child, status);
            return Ok(Complete(child as isize));
        }
        if let Some(p) = self.procs.get_mut(cur) {
            p.waiting_for_child_exit = true;
        }
        self.block_current(QueueTag::WaitingChild, PendingSyscall::Wait { status_addr })?;
        Ok(Blocked)
    }

    pub fn handle_getpid(&mut self) -> Result<SyscallOutcome, KernelError> {
        Ok(Complete(self.sched.running() as isize))
    }

    /// Move the heap break to `addr`.
    pub fn handle_brk(&mut self, addr: usize) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let pcb = self
            .procs
            .get_mut(cur)
            .ok_or(KernelError::Switch(SwitchError::UnknownProcess(cur)))?;
        let (floor, brk) = (pcb.brk_floor_page, pcb.brk_page);
        let Some(table) = pcb.region1.as_mut() else {
            return Ok(Complete(ERROR));
        };
        match address_space::set_break(
            &mut self.frame_table,
            &mut self.machine,
            table,
            floor,
            brk,
            addr,
        ) {
            Ok(new_brk) => {
                pcb.brk_page = new_brk;
                Ok(Complete(0))
            }
            Err(e) => {
                trace_printf!(1, "BRK: pid {} rejected ({:?})", cur, e);
                Ok(Complete(ERROR))
            }
        }
    }

    /// Sleep for `ticks` clock interrupts.
    pub fn handle_delay(&mut self, ticks: isize) -> Result<SyscallOutcome, KernelError> {
        if ticks < 0 {
            return Ok(Complete(ERROR));
        }
        if ticks == 0 {
            return Ok(Complete(0));
        }
        let cur = self.sched.running();
        if let Some(pcb) = self.procs.get_mut(cur) {
            pcb.delay_ticks = ticks as usize;
        }
        self.sched.delay.insert(cur);
        self.block_current(QueueTag::Delay, PendingSyscall::Delay)?;
        Ok(Blocked)
    }

    pub fn handle_lock_init(&mut self) -> Result<SyscallOutcome, KernelError> {
        let id = self.alloc_resource_id(ResourceKind::Lock);
        self.locks.insert(id, Lock::new(id));
        trace_printf!(2, "LOCK_INIT: id {}", id);
        Ok(Complete(id as isize))
    }

    /// Acquire a lock, blocking while someone else holds it. Acquiring a
    /// lock the caller already holds succeeds immediately.
    pub fn handle_acquire(&mut self, id: ResourceId) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let Some(lock) = self.locks.get_mut(&id) else {
            return Ok(Complete(ERROR));
        };
        match lock.try_acquire(cur) {
            AcquireOutcome::Acquired => Ok(Complete(0)),
            AcquireOutcome::MustWait => {
                lock.waiters.push_back(cur);
                self.block_current(QueueTag::Lock(id), PendingSyscall::Acquire { lock: id })?;
                Ok(Blocked)
            }
        }
    }

    pub fn handle_release(&mut self, id: ResourceId) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let Some(lock) = self.locks.get_mut(&id) else {
            return Ok(Complete(ERROR));
        };
        match lock.release(cur) {
            Err(e) => {
                trace_printf!(1, "RELEASE: {}", e);
                Ok(Complete(ERROR))
            }
            Ok(Some(next)) => {
                self.wake(next);
                Ok(Complete(0))
            }
            Ok(None) => Ok(Complete(0)),
        }
    }

    pub fn handle_cvar_init(&mut self) -> Result<SyscallOutcome, KernelError> {
        let id = self.alloc_resource_id(ResourceKind::Cvar);
        self.cvars.insert(id, Cvar::new(id));
        trace_printf!(2, "CVAR_INIT: id {}", id);
        Ok(Complete(id as isize))
    }

    /// Atomically release `lock_id` and sleep on `cvar_id`. The caller
    /// must hold the lock; on wake it owns the lock again before the
    /// call returns (Mesa semantics, so the condition must be rechecked).
    pub fn handle_cvar_wait(
        &mut self,
        cvar_id: ResourceId,
        lock_id: ResourceId,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        let owns = self
            .locks
            .get(&lock_id)
            .map(|l| l.owner() == Some(cur))
            .unwrap_or(false);
        if !owns || !self.cvars.contains_key(&cvar_id) {
            return Ok(Complete(ERROR));
        }
        let handoff = match self.locks.get_mut(&lock_id) {
            Some(l) => l.release(cur).unwrap_or(None),
            None => None,
        };
        if let Some(next) = handoff {
            self.wake(next);
        }
        if let Some(cvar) = self.cvars.get_mut(&cvar_id) {
            cvar.waiters.push_back(cur);
        }
        self.block_current(
            QueueTag::Cvar(cvar_id),
            PendingSyscall::CvarWait {
                cvar: cvar_id,
                lock: lock_id,
            },
        )?;
        Ok(Blocked)
    }

    pub fn handle_cvar_signal(&mut self, id: ResourceId) -> Result<SyscallOutcome, KernelError> {
        let Some(cvar) = self.cvars.get_mut(&id) else {
            return Ok(Complete(ERROR));
        };
        if let Some(pid) = cvar.signal() {
            self.wake(pid);
        }
        Ok(Complete(0))
    }

    pub fn handle_cvar_broadcast(&mut self, id: ResourceId) -> Result<SyscallOutcome, KernelError> {
        let Some(cvar) = self.cvars.get_mut(&id) else {
            return Ok(Complete(ERROR));
        };
        let woken = cvar.broadcast();
        for pid in woken {
            self.wake(pid);
        }
        Ok(Complete(0))
    }

    pub fn handle_pipe_init(&mut self) -> Result<SyscallOutcome, KernelError> {
        let id = self.alloc_resource_id(ResourceKind::Pipe);
        self.pipes.insert(id, Pipe::new(id));
        trace_printf!(2, "PIPE_INIT: id {}", id);
        Ok(Complete(id as isize))
    }

    /// Read up to `len` bytes from a pipe, blocking while it is empty.
    /// Returns as soon as any bytes are available.
    pub fn handle_pipe_read(
        &mut self,
        id: ResourceId,
        addr: usize,
        len: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        if !self.pipes.contains_key(&id) {
            return Ok(Complete(ERROR));
        }
        let ok = self
            .current_pcb()?
            .region1
            .as_ref()
            .map(|t| check::check_buffer(t, addr, len, Protection::READ_WRITE).is_ok())
            .unwrap_or(false);
        if !ok {
            return Ok(Complete(ERROR));
        }
        if len == 0 {
            return Ok(Complete(0));
        }
        let empty = self.pipes.get(&id).map(|p| p.is_empty()).unwrap_or(true);
        if empty {
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.read_waiters.push_back(cur);
            }
            self.block_current(
                QueueTag::PipeRead(id),
                PendingSyscall::PipeRead { pipe: id, addr, len },
            )?;
            return Ok(Blocked);
        }
        let mut buf = alloc::vec![0u8; len];
        let n = self.pipes.get(&id).map(|p| p.read_into(&mut buf)).unwrap_or(0);
        if let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) {
            copy_to_user(&mut self.machine, table, addr, &buf[..n])?;
        }
        if let Some(writer) = self.pipes.get_mut(&id).and_then(|p| p.write_waiters.pop_front()) {
            self.wake(writer);
        }
        Ok(Complete(n as isize))
    }

    /// Write `len` bytes into a pipe. The write completes in full:
    /// whatever does not fit now is pushed as readers drain the buffer,
    /// with the caller blocked until the last byte is in.
    pub fn handle_pipe_write(
        &mut self,
        id: ResourceId,
        addr: usize,
        len: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        if !self.pipes.contains_key(&id) {
            return Ok(Complete(ERROR));
        }
        let ok = self
            .current_pcb()?
            .region1
            .as_ref()
            .map(|t| check::check_buffer(t, addr, len, Protection::READ).is_ok())
            .unwrap_or(false);
        if !ok {
            return Ok(Complete(ERROR));
        }
        if len == 0 {
            return Ok(Complete(0));
        }
        let mut data = alloc::vec![0u8; len];
        if let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) {
            copy_from_user(&self.machine, table, addr, &mut data)?;
        }
        let written = self.pipes.get(&id).map(|p| p.write_from(&data)).unwrap_or(0);
        if written > 0 {
            if let Some(reader) = self.pipes.get_mut(&id).and_then(|p| p.read_waiters.pop_front())
            {
                self.wake(reader);
            }
        }
        if written == len {
            return Ok(Complete(len as isize));
        }
        if let Some(pipe) = self.pipes.get_mut(&id) {
            pipe.write_waiters.push_back(cur);
        }
        self.block_current(
            QueueTag::PipeWrite(id),
            PendingSyscall::PipeWrite {
                pipe: id,
                addr,
                len,
                written,
            },
        )?;
        Ok(Blocked)
    }

    /// Read buffered terminal input, blocking while there is none.
    pub fn handle_tty_read(
        &mut self,
        tty_id: usize,
        addr: usize,
        len: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        if tty_id >= TTY_COUNT {
            return Ok(Complete(ERROR));
        }
        let ok = self
            .current_pcb()?
            .region1
            .as_ref()
            .map(|t| check::check_buffer(t, addr, len, Protection::READ_WRITE).is_ok())
            .unwrap_or(false);
        if !ok {
            return Ok(Complete(ERROR));
        }
        if len == 0 {
            return Ok(Complete(0));
        }
        if self.ttys[tty_id].input_len() == 0 {
            self.ttys[tty_id].read_waiters.push_back(cur);
            self.block_current(
                QueueTag::TtyRead(tty_id),
                PendingSyscall::TtyRead { tty: tty_id, addr, len },
            )?;
            return Ok(Blocked);
        }
        let mut buf = alloc::vec![0u8; len];
        let n = self.ttys[tty_id].read_input(&mut buf);
        if let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) {
            copy_to_user(&mut self.machine, table, addr, &buf[..n])?;
        }
        Ok(Complete(n as isize))
    }

    /// Write bytes to a terminal. The caller blocks until its whole
    /// buffer has been transmitted; writers queue so their output is
    /// never interleaved.
    pub fn handle_tty_write(
        &mut self,
        tty_id: usize,
        addr: usize,
        len: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cur = self.sched.running();
        if tty_id >= TTY_COUNT {
            return Ok(Complete(ERROR));
        }
        let ok = self
            .current_pcb()?
            .region1
            .as_ref()
            .map(|t| check::check_buffer(t, addr, len, Protection::READ).is_ok())
            .unwrap_or(false);
        if !ok {
            return Ok(Complete(ERROR));
        }
        if len == 0 {
            return Ok(Complete(0));
        }
        if self.ttys[tty_id].active.is_none() {
            let mut data = alloc::vec![0u8; len];
            if let Some(table) = self.procs.get(cur).and_then(|p| p.region1.as_ref()) {
                copy_from_user(&self.machine, table, addr, &mut data)?;
            }
            let transmit = crate::tty::TtyTransmit::new(cur, data);
            self.machine.tty_transmit(tty_id, transmit.chunk())?;
            self.ttys[tty_id].active = Some(transmit);
        } else {
            self.ttys[tty_id].write_waiters.push_back(cur);
        }
        self.block_current(
            QueueTag::TtyWrite(tty_id),
            PendingSyscall::TtyWrite { tty: tty_id, addr, len },
        )?;
        Ok(Blocked)
    }

    /// Destroy a lock, cvar, or pipe, releasing its waiters with an
    /// error result.
    pub fn handle_reclaim(&mut self, id: ResourceId) -> Result<SyscallOutcome, KernelError> {
        self.handle_reclaim_with(id, ReclaimPolicy::ReleaseWaiters)
    }

    /// Destroy a resource with an explicit waiter policy.
    pub fn handle_reclaim_with(
        &mut self,
        id: ResourceId,
        policy: ReclaimPolicy,
    ) -> Result<SyscallOutcome, KernelError> {
        let Some(kind) = self.resource_kinds.remove(&id) else {
            return Ok(Complete(ERROR));
        };
        let mut waiters: Vec<crate::process::Pid> = Vec::new();
        match kind {
            ResourceKind::Lock => {
                if let Some(mut lock) = self.locks.remove(&id) {
                    while let Some(pid) = lock.waiters.pop_front() {
                        waiters.push(pid);
                    }
                }
            }
            ResourceKind::Cvar => {
                if let Some(mut cvar) = self.cvars.remove(&id) {
                    while let Some(pid) = cvar.waiters.pop_front() {
                        waiters.push(pid);
                    }
                }
            }
            ResourceKind::Pipe => {
                if let Some(mut pipe) = self.pipes.remove(&id) {
                    while let Some(pid) = pipe.read_waiters.pop_front() {
                        waiters.push(pid);
                    }
                    while let Some(pid) = pipe.write_waiters.pop_front() {
                        waiters.push(pid);
                    }
                }
            }
        }
        trace_printf!(1, "RECLAIM: {:?} {} with {} waiters", kind, id, waiters.len());
        for pid in waiters {
            match policy {
                ReclaimPolicy::ReleaseWaiters => self.wake_with_error(pid),
                ReclaimPolicy::KillWaiters => self.force_kill(pid),
            }
        }
        Ok(Complete(0))
    }
}

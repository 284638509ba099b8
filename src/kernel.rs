//! The kernel proper: owns the machine, the frame table, the region-0
//! table, the process table, the scheduler, and every syncable resource.
//! Syscall handlers live in [`crate::syscalls`], trap handlers in
//! [`crate::traps`]; both are written against this state.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::hardware::{
    Machine, MachineError, Region, KERNEL_STACK_PAGES, PAGE_SIZE, TTY_COUNT,
};
use crate::ipc::Pipe;
use crate::loader::{LoadError, ProgramLoader};
use crate::memory::address_space::{self, DEFAULT_STACK_GUARD_PAGES};
use crate::memory::{FrameTable, PageTable, Protection};
use crate::process::context::SwitchError;
use crate::process::pcb::{PendingSyscall, ProcessError};
use crate::process::{Pid, ProcessControlBlock, ProcessTable, QueueTag, Scheduler};
use crate::sync::{AcquireOutcome, Cvar, Lock};
use crate::trace_printf;
use crate::tty::{Tty, TtyTransmit};
use crate::{ResourceId, ERROR};

/// Exit code recorded for a process the kernel killed (fault, failed
/// exec, reclaim of a resource it was blocked on).
pub const KILLED: i32 = -2;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub pmem_size: usize,
    pub stack_guard_pages: usize,
    pub trace_level: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            pmem_size: 256 * PAGE_SIZE,
            stack_guard_pages: DEFAULT_STACK_GUARD_PAGES,
            trace_level: 1,
        }
    }
}

/// A kernel-internal failure. Syscall-level failures are reported to the
/// caller as `ERROR`; these are the ones that mean the kernel itself is
/// in trouble, and the trap layer halts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Switch(SwitchError),
    Process(ProcessError),
    Load(LoadError),
    Machine(MachineError),
}

impl From<SwitchError> for KernelError {
    fn from(e: SwitchError) -> Self {
        KernelError::Switch(e)
    }
}

impl From<ProcessError> for KernelError {
    fn from(e: ProcessError) -> Self {
        KernelError::Process(e)
    }
}

impl From<LoadError> for KernelError {
    fn from(e: LoadError) -> Self {
        KernelError::Load(e)
    }
}

impl From<MachineError> for KernelError {
    fn from(e: MachineError) -> Self {
        KernelError::Machine(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Switch(e) => write!(f, "context switch failed: {}", e),
            KernelError::Process(e) => write!(f, "{}", e),
            KernelError::Load(e) => write!(f, "{}", e),
            KernelError::Machine(e) => write!(f, "machine error: {:?}", e),
        }
    }
}

/// What an id in the shared resource id space refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Lock,
    Cvar,
    Pipe,
}

pub struct Kernel {
    pub machine: Machine,
    pub frame_table: FrameTable,
    pub region0: PageTable,
    pub procs: ProcessTable,
    pub sched: Scheduler,
    pub locks: BTreeMap<ResourceId, Lock>,
    pub cvars: BTreeMap<ResourceId, Cvar>,
    pub pipes: BTreeMap<ResourceId, Pipe>,
    pub(crate) resource_kinds: BTreeMap<ResourceId, ResourceKind>,
    pub(crate) next_resource_id: ResourceId,
    pub ttys: Vec<Tty>,
    pub loader: Box<dyn ProgramLoader + Send>,
    pub config: KernelConfig,
    pub halted: bool,
    init_pid: Pid,
}

/// Privileged copy into a process's region 1, walking its table directly.
/// The kernel sees physical memory; neither the TLB nor the page
/// protections apply. Callers validate pointers first.
pub fn copy_to_user(
    machine: &mut Machine,
    table: &PageTable,
    addr: usize,
    data: &[u8],
) -> Result<(), MachineError> {
    let mut done = 0;
    while done < data.len() {
        let va = addr + done;
        let vpn = Region::One
            .vpn_of(va)
            .ok_or(MachineError::BadAddress(va))?;
        let pte = table.get(vpn).ok_or(MachineError::BadAddress(va))?;
        if !pte.valid {
            return Err(MachineError::TranslationFault {
                region: Region::One,
                addr: va,
            });
        }
        let off = va & (PAGE_SIZE - 1);
        let n = core::cmp::min(PAGE_SIZE - off, data.len() - done);
        let frame = machine.frame_mut(pte.pfn)?;
        frame[off..off + n].copy_from_slice(&data[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Privileged copy out of a process's region 1.
pub fn copy_from_user(
    machine: &Machine,
    table: &PageTable,
    addr: usize,
    out: &mut [u8],
) -> Result<(), MachineError> {
    let mut done = 0;
    while done < out.len() {
        let va = addr + done;
        let vpn = Region::One
            .vpn_of(va)
            .ok_or(MachineError::BadAddress(va))?;
        let pte = table.get(vpn).ok_or(MachineError::BadAddress(va))?;
        if !pte.valid {
            return Err(MachineError::TranslationFault {
                region: Region::One,
                addr: va,
            });
        }
        let off = va & (PAGE_SIZE - 1);
        let n = core::cmp::min(PAGE_SIZE - off, out.len() - done);
        let frame = machine.frame(pte.pfn)?;
        out[done..done + n].copy_from_slice(&frame[off..off + n]);
        done += n;
    }
    Ok(())
}

impl Kernel {
    /// Bring the machine up: build the frame table and region 0, create
    /// the idle process (running, on the boot stack) and the init
    /// process, and load `init_program` into init's address space.
    pub fn boot(
        config: KernelConfig,
        loader: Box<dyn ProgramLoader + Send>,
        init_program: &str,
        init_args: &[Vec<u8>],
    ) -> Result<Self, KernelError> {
        crate::trace::set_trace_level(config.trace_level);
        let mut machine = Machine::new(config.pmem_size);
        let mut frame_table = FrameTable::new(machine.num_frames());
        let region0 = address_space::build_region0(&mut frame_table)
            .map_err(|_| KernelError::Load(LoadError::OutOfMemory))?;

        let mut procs = ProcessTable::new();
        let idle_pid = procs.alloc_pid()?;
        procs.insert(ProcessControlBlock::new(idle_pid, None));
        let mut sched = Scheduler::new(idle_pid);

        let init_pid = procs.alloc_pid()?;
        let mut init = ProcessControlBlock::new(init_pid, None);
        for i in 0..KERNEL_STACK_PAGES {
            let pfn = frame_table
                .allocate(0)
                .map_err(|_| KernelError::Load(LoadError::OutOfMemory))?;
            init.kernel_stack[i] =
                crate::memory::PageTableEntry::mapped(pfn, Protection::READ_WRITE);
        }
        loader.load(&mut machine, &mut frame_table, &mut init, init_program, init_args)?;
        procs.insert(init);
        sched.make_ready(&mut procs, init_pid);

        machine.set_ptbr1(idle_pid);
        trace_printf!(0, "BOOT: idle pid {}, init pid {}", idle_pid, init_pid);

        Ok(Kernel {
            machine,
            frame_table,
            region0,
            procs,
            sched,
            locks: BTreeMap::new(),
            cvars: BTreeMap::new(),
            pipes: BTreeMap::new(),
            resource_kinds: BTreeMap::new(),
            next_resource_id: 0,
            ttys: (0..TTY_COUNT).map(Tty::new).collect(),
            loader,
            config,
            halted: false,
            init_pid,
        })
    }

    pub fn current(&self) -> Pid {
        self.sched.running()
    }

    pub fn init_pid(&self) -> Pid {
        self.init_pid
    }

    pub(crate) fn alloc_resource_id(&mut self, kind: ResourceKind) -> ResourceId {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        self.resource_kinds.insert(id, kind);
        id
    }

    /// Deposit a syscall result in a not-running process's saved user
    /// context; it takes effect when the process is next installed.
    fn deposit(&mut self, pid: Pid, value: isize) {
        if let Some(pcb) = self.procs.get_mut(pid) {
            pcb.user_context.regs[0] = value;
            pcb.queue = QueueTag::None;
        }
        self.sched.make_ready(&mut self.procs, pid);
    }

    /// Wake a blocked process: finish whatever syscall it was sleeping
    /// in, deposit the result, and put it on the ready queue. Called when
    /// the thing it waited for has arrived (a release, a signal, pipe
    /// bytes, a typed line, a finished transmit, an expired delay, an
    /// exited child).
    pub fn wake(&mut self, pid: Pid) {
        let pending = match self.procs.get_mut(pid) {
            Some(pcb) => pcb.pending.take(),
            None => return,
        };
        match pending {
            None => {
                self.deposit(pid, 0);
            }
            Some(PendingSyscall::Delay) => {
                self.deposit(pid, 0);
            }
            Some(PendingSyscall::Acquire { .. }) => {
                // Ownership was handed over by the releaser.
                self.deposit(pid, 0);
            }
            Some(PendingSyscall::CvarWait { cvar: _, lock }) => {
                // Mesa: the woken waiter must get the lock back before it
                // returns from the wait.
                match self.locks.get_mut(&lock) {
                    Some(l) => match l.try_acquire(pid) {
                        AcquireOutcome::Acquired => self.deposit(pid, 0),
                        AcquireOutcome::MustWait => {
                            l.waiters.push_back(pid);
                            if let Some(pcb) = self.procs.get_mut(pid) {
                                pcb.queue = QueueTag::Lock(lock);
                                pcb.pending = Some(PendingSyscall::Acquire { lock });
                            }
                        }
                    },
                    // The lock was reclaimed while we slept.
                    None => self.deposit(pid, ERROR),
                }
            }
            Some(PendingSyscall::Wait { status_addr }) => {
                self.finish_wait(pid, status_addr);
            }
            Some(PendingSyscall::PipeRead { pipe, addr, len }) => {
                self.finish_pipe_read(pid, pipe, addr, len);
            }
            Some(PendingSyscall::PipeWrite {
                pipe,
                addr,
                len,
                written,
            }) => {
                self.continue_pipe_write(pid, pipe, addr, len, written);
            }
            Some(PendingSyscall::TtyRead { tty, addr, len }) => {
                self.finish_tty_read(pid, tty, addr, len);
            }
            Some(PendingSyscall::TtyWrite { len, .. }) => {
                self.deposit(pid, len as isize);
            }
        }
    }

    /// Wake a blocked process with an error result, abandoning whatever
    /// it was waiting for. Used when the resource goes away.
    pub fn wake_with_error(&mut self, pid: Pid) {
        if let Some(pcb) = self.procs.get_mut(pid) {
            pcb.pending = None;
            pcb.waiting_for_child_exit = false;
        }
        self.deposit(pid, ERROR);
    }

    fn finish_wait(&mut self, parent: Pid, status_addr: usize) {
        let child = match self.procs.get(parent).and_then(|p| p.exited_child(&self.procs)) {
            Some(c) => c,
            // Spurious wake; block again.
            None => {
                if let Some(pcb) = self.procs.get_mut(parent) {
                    pcb.pending = Some(PendingSyscall::Wait { status_addr });
                }
                return;
            }
        };
        let status = match self.procs.remove(child) {
            Some(zombie) => zombie.exit_code,
            None => KILLED,
        };
        if let Some(pcb) = self.procs.get_mut(parent) {
            pcb.remove_child(child);
            pcb.waiting_for_child_exit = false;
        }
        if status_addr != 0 {
            if let Some(table) = self.procs.get(parent).and_then(|p| p.region1.as_ref()) {
                let _ = copy_to_user(&mut self.machine, table, status_addr, &status.to_ne_bytes());
            }
        }
        trace_printf!(2, "WAIT: pid {} reaped child {} (status {})", parent, child, status);
        self.deposit(parent, child as isize);
    }

    fn finish_pipe_read(&mut self, pid: Pid, pipe_id: ResourceId, addr: usize, len: usize) {
        let mut buf = alloc::vec![0u8; len];
        let n = match self.pipes.get(&pipe_id) {
            Some(pipe) => pipe.read_into(&mut buf),
            None => {
                self.deposit(pid, ERROR);
                return;
            }
        };
        if n == 0 {
            // Someone drained it first; keep waiting.
            if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
                pipe.read_waiters.push_back(pid);
            }
            if let Some(pcb) = self.procs.get_mut(pid) {
                pcb.queue = QueueTag::PipeRead(pipe_id);
                pcb.pending = Some(PendingSyscall::PipeRead { pipe: pipe_id, addr, len });
            }
            return;
        }
        if let Some(table) = self.procs.get(pid).and_then(|p| p.region1.as_ref()) {
            let _ = copy_to_user(&mut self.machine, table, addr, &buf[..n]);
        }
        self.deposit(pid, n as isize);
        // Space opened up for a blocked writer.
        if let Some(writer) = self.pipes.get_mut(&pipe_id).and_then(|p| p.write_waiters.pop_front())
        {
            self.wake(writer);
        }
    }

    fn continue_pipe_write(
        &mut self,
        pid: Pid,
        pipe_id: ResourceId,
        addr: usize,
        len: usize,
        written: usize,
    ) {
        let mut buf = alloc::vec![0u8; len - written];
        let table_ok = match self.procs.get(pid).and_then(|p| p.region1.as_ref()) {
            Some(table) => {
                copy_from_user(&self.machine, table, addr + written, &mut buf).is_ok()
            }
            None => false,
        };
        if !table_ok || !self.pipes.contains_key(&pipe_id) {
            self.deposit(pid, ERROR);
            return;
        }
        let n = self.pipes.get(&pipe_id).map(|p| p.write_from(&buf)).unwrap_or(0);
        let written = written + n;
        if written < len {
            if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
                pipe.write_waiters.push_back(pid);
            }
            if let Some(pcb) = self.procs.get_mut(pid) {
                pcb.queue = QueueTag::PipeWrite(pipe_id);
                pcb.pending = Some(PendingSyscall::PipeWrite {
                    pipe: pipe_id,
                    addr,
                    len,
                    written,
                });
            }
        } else {
            self.deposit(pid, len as isize);
        }
        if n > 0 {
            if let Some(reader) = self
                .pipes
                .get_mut(&pipe_id)
                .and_then(|p| p.read_waiters.pop_front())
            {
                self.wake(reader);
            }
        }
    }

    fn finish_tty_read(&mut self, pid: Pid, tty_id: usize, addr: usize, len: usize) {
        let mut buf = alloc::vec![0u8; len];
        let n = match self.ttys.get(tty_id) {
            Some(tty) => tty.read_input(&mut buf),
            None => {
                self.deposit(pid, ERROR);
                return;
            }
        };
        if n == 0 {
            if let Some(tty) = self.ttys.get_mut(tty_id) {
                tty.read_waiters.push_back(pid);
            }
            if let Some(pcb) = self.procs.get_mut(pid) {
                pcb.queue = QueueTag::TtyRead(tty_id);
                pcb.pending = Some(PendingSyscall::TtyRead { tty: tty_id, addr, len });
            }
            return;
        }
        if let Some(table) = self.procs.get(pid).and_then(|p| p.region1.as_ref()) {
            let _ = copy_to_user(&mut self.machine, table, addr, &buf[..n]);
        }
        self.deposit(pid, n as isize);
    }

    /// Start a queued terminal write transmitting: copy its bytes out of
    /// the writer's address space and hand the first chunk to hardware.
    /// The writer keeps its pending record until the last chunk lands.
    pub(crate) fn start_tty_transmit(&mut self, tty_id: usize, pid: Pid) -> Result<(), KernelError> {
        let (addr, len) = match self.procs.get(pid).map(|p| p.pending) {
            Some(Some(PendingSyscall::TtyWrite { addr, len, .. })) => (addr, len),
            _ => {
                self.wake_with_error(pid);
                return Ok(());
            }
        };
        let mut data = alloc::vec![0u8; len];
        let ok = match self.procs.get(pid).and_then(|p| p.region1.as_ref()) {
            Some(table) => copy_from_user(&self.machine, table, addr, &mut data).is_ok(),
            None => false,
        };
        if !ok {
            self.wake_with_error(pid);
            return Ok(());
        }
        let tty = &mut self.ttys[tty_id];
        let transmit = TtyTransmit::new(pid, data);
        self.machine.tty_transmit(tty_id, transmit.chunk())?;
        tty.active = Some(transmit);
        Ok(())
    }

    /// Block the running process: the caller has already put it on its
    /// wait queue; this records the tag and continuation and switches to
    /// the next runnable process.
    pub(crate) fn block_current(
        &mut self,
        tag: QueueTag,
        pending: PendingSyscall,
    ) -> Result<(), KernelError> {
        let cur = self.sched.running();
        if let Some(pcb) = self.procs.get_mut(cur) {
            pcb.queue = tag;
            pcb.pending = Some(pending);
        }
        self.sched.install_next(
            &mut self.procs,
            &mut self.machine,
            &mut self.region0,
            &mut self.frame_table,
            crate::process::Disposition::Block,
        )?;
        Ok(())
    }

    /// Force-kill a blocked process (it is not running). Its address
    /// space and kernel stack are freed immediately; a live parent gets a
    /// zombie to Wait on.
    pub(crate) fn force_kill(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get_mut(pid) else { return };
        let table = pcb.region1.take();
        let stack = pcb.kernel_stack;
        pcb.kernel_stack = [crate::memory::PageTableEntry::INVALID; KERNEL_STACK_PAGES];
        pcb.has_exited = true;
        pcb.exit_code = KILLED;
        pcb.pending = None;
        pcb.queue = QueueTag::None;
        pcb.delay_ticks = 0;
        let parent = pcb.parent;
        let children = core::mem::take(&mut pcb.children);
        address_space::teardown(&mut self.frame_table, &mut self.machine, table);
        for pte in stack {
            if pte.valid {
                let _ = self.frame_table.free(pte.pfn);
            }
        }
        self.sched.ready.remove(pid);
        self.sched.delay.remove(pid);
        trace_printf!(1, "killed blocked process {}", pid);

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

        match parent.filter(|p| self.procs.contains(*p)) {
            Some(ppid) => {
                let waiting = self
                    .procs
                    .get(ppid)
                    .map(|p| p.waiting_for_child_exit)
                    .unwrap_or(false);
                if waiting {
                    self.wake(ppid);
                }
            }
            None => {
                // No one will ever Wait for it.
                self.procs.remove(pid);
            }
        }
    }

    /// A fatal kernel error or an exiting init process ends the world.
    pub fn halt(&mut self) {
        trace_printf!(0, "HALT");
        self.halted = true;
    }
}

static KERNEL: OnceCell<Mutex<Kernel>> = OnceCell::uninit();

/// Boot the global kernel instance. Later traps and syscalls reach it
/// through [`with_kernel`].
pub fn boot_global(
    config: KernelConfig,
    loader: Box<dyn ProgramLoader + Send>,
    init_program: &str,
    init_args: &[Vec<u8>],
) -> Result<(), KernelError> {
    let kernel = Kernel::boot(config, loader, init_program, init_args)?;
    KERNEL.init_once(|| Mutex::new(kernel));
    Ok(())
}

pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    KERNEL.get().map(|cell| f(&mut cell.lock()))
}

//! Process control blocks and the pid-indexed process table.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::hardware::{KernelContext, UserContext, KERNEL_STACK_PAGES};
use crate::memory::page_table::{PageTable, PageTableEntry};
use crate::ResourceId;

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NoSuchProcess(Pid),
    /// The pid space wrapped into a live pid.
    PidExhausted,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NoSuchProcess(pid) => write!(f, "no such process {}", pid),
            ProcessError::PidExhausted => write!(f, "pid space exhausted"),
        }
    }
}

/// Which wait queue (if any) a process currently sits on. Kept in the PCB
/// so a dying process can be pulled off its queue without searching them
/// all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTag {
    None,
    Ready,
    Lock(ResourceId),
    Cvar(ResourceId),
    PipeRead(ResourceId),
    PipeWrite(ResourceId),
    TtyRead(usize),
    TtyWrite(usize),
    Delay,
    /// Blocked in Wait until some child exits.
    WaitingChild,
}

/// The half-finished syscall of a blocked process. When the process is
/// woken the kernel finishes the operation described here and deposits
/// the result in the saved user context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSyscall {
    Wait { status_addr: usize },
    Acquire { lock: ResourceId },
    CvarWait { cvar: ResourceId, lock: ResourceId },
    PipeRead { pipe: ResourceId, addr: usize, len: usize },
    PipeWrite { pipe: ResourceId, addr: usize, len: usize, written: usize },
    TtyRead { tty: usize, addr: usize, len: usize },
    TtyWrite { tty: usize, addr: usize, len: usize },
    Delay,
}

/// Everything the kernel knows about one process.
#[derive(Debug)]
pub struct ProcessControlBlock {
    pub pid: Pid,
    /// The frames holding this process's kernel stack, as region-0 PTEs
    /// ready to swap in at the fixed top-of-region pages.
    pub kernel_stack: [PageTableEntry; KERNEL_STACK_PAGES],
    /// `None` once the space is torn down (zombie).
    pub region1: Option<PageTable>,
    pub user_context: UserContext,
    pub kernel_context: KernelContext,
    /// Exclusive end of the heap, in region-1 pages.
    pub brk_page: usize,
    /// Load-time end of text+data; the heap never shrinks below this.
    pub brk_floor_page: usize,
    pub has_exited: bool,
    pub exit_code: i32,
    pub waiting_for_child_exit: bool,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    /// Clock ticks left before a Delay completes.
    pub delay_ticks: usize,
    pub queue: QueueTag,
    pub pending: Option<PendingSyscall>,
}

impl ProcessControlBlock {
    pub fn new(pid: Pid, parent: Option<Pid>) -> Self {
        ProcessControlBlock {
            pid,
            kernel_stack: [PageTableEntry::INVALID; KERNEL_STACK_PAGES],
            region1: None,
            user_context: UserContext::default(),
            kernel_context: KernelContext::default(),
            brk_page: 0,
            brk_floor_page: 0,
            has_exited: false,
            exit_code: 0,
            waiting_for_child_exit: false,
            parent,
            children: Vec::new(),
            delay_ticks: 0,
            queue: QueueTag::None,
            pending: None,
        }
    }

    /// A zombie: exited, space torn down, PCB retained only for Wait.
    pub fn is_zombie(&self) -> bool {
        self.has_exited
    }

    pub fn remove_child(&mut self, pid: Pid) {
        self.children.retain(|&c| c != pid);
    }

    /// First exited child, if any.
    pub fn exited_child(&self, procs: &ProcessTable) -> Option<Pid> {
        self.children
            .iter()
            .copied()
            .find(|&c| procs.get(c).map(|p| p.has_exited).unwrap_or(false))
    }
}

/// The pid-indexed table of all live (and zombie) processes.
#[derive(Debug, Default)]
pub struct ProcessTable {
    procs: BTreeMap<Pid, ProcessControlBlock>,
    next_pid: Pid,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            procs: BTreeMap::new(),
            next_pid: 0,
        }
    }

    /// Allocate the next unused pid.
    pub fn alloc_pid(&mut self) -> Result<Pid, ProcessError> {
        for _ in 0..=Pid::MAX as usize {
            let pid = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1);
            if !self.procs.contains_key(&pid) {
                return Ok(pid);
            }
        }
        Err(ProcessError::PidExhausted)
    }

    pub fn insert(&mut self, pcb: ProcessControlBlock) {
        self.procs.insert(pcb.pid, pcb);
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessControlBlock> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessControlBlock> {
        self.procs.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessControlBlock> {
        self.procs.remove(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique_and_increasing() {
        let mut pt = ProcessTable::new();
        let a = pt.alloc_pid().unwrap();
        pt.insert(ProcessControlBlock::new(a, None));
        let b = pt.alloc_pid().unwrap();
        pt.insert(ProcessControlBlock::new(b, Some(a)));
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn alloc_skips_live_pids_after_wrap() {
        let mut pt = ProcessTable::new();
        pt.insert(ProcessControlBlock::new(0, None));
        pt.insert(ProcessControlBlock::new(1, None));
        pt.next_pid = Pid::MAX;
        assert_eq!(pt.alloc_pid().unwrap(), Pid::MAX);
        // Wraps past the two live pids.
        assert_eq!(pt.alloc_pid().unwrap(), 2);
    }

    #[test]
    fn exited_child_lookup() {
        let mut pt = ProcessTable::new();
        let mut parent = ProcessControlBlock::new(1, None);
        parent.children = alloc::vec![2, 3];
        let child_a = ProcessControlBlock::new(2, Some(1));
        let mut child_b = ProcessControlBlock::new(3, Some(1));
        child_b.has_exited = true;
        pt.insert(child_a);
        pt.insert(child_b);
        assert_eq!(parent.exited_child(&pt), Some(3));
    }
}

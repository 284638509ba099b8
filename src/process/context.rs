//! The kernel-context switch engine. A process's kernel stack lives at a
//! fixed virtual range at the top of region 0; switching processes means
//! swapping which physical frames back those pages, flushing the stale
//! TLB entries, and swapping the saved machine contexts.

use core::fmt;

use crate::hardware::{
    Machine, MachineError, Region, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_PAGES, PAGE_SHIFT,
    PAGE_SIZE,
};
use crate::memory::address_space::StagingWindow;
use crate::memory::frame_table::FrameTable;
use crate::memory::page_table::{PageTable, PageTableEntry, Protection};
use crate::process::pcb::{Pid, ProcessControlBlock};
use crate::trace_printf;

/// Which side of a fork this context is. Both sides run the same code
/// after the clone; the variant tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cloned {
    Parent(Pid),
    Child,
}

impl Cloned {
    /// The value the fork syscall returns on this side: the child's pid
    /// in the parent, zero in the child.
    pub fn return_value(self) -> isize {
        match self {
            Cloned::Parent(pid) => pid as isize,
            Cloned::Child => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchError {
    /// The incoming process has no kernel stack to install.
    NoKernelStack(Pid),
    /// A pid named by a queue has no PCB behind it.
    UnknownProcess(Pid),
    OutOfMemory,
    Machine(MachineError),
}

impl From<MachineError> for SwitchError {
    fn from(e: MachineError) -> Self {
        SwitchError::Machine(e)
    }
}

impl fmt::Display for SwitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchError::NoKernelStack(pid) => write!(f, "process {} has no kernel stack", pid),
            SwitchError::UnknownProcess(pid) => write!(f, "unknown process {}", pid),
            SwitchError::OutOfMemory => write!(f, "out of frames for kernel stack"),
            SwitchError::Machine(e) => write!(f, "machine error during switch: {:?}", e),
        }
    }
}

fn install_stack(
    machine: &mut Machine,
    region0: &mut PageTable,
    inc: &ProcessControlBlock,
) -> Result<(), SwitchError> {
    for pte in &inc.kernel_stack {
        if !pte.valid {
            return Err(SwitchError::NoKernelStack(inc.pid));
        }
    }
    for (i, pte) in inc.kernel_stack.iter().enumerate() {
        region0.set(KERNEL_STACK_BASE_PAGE + i, *pte);
    }
    // The old stack's translations must die before the new stack is used.
    machine.tlb().flush_kstack();
    machine.set_live_kernel_context(inc.kernel_context.clone());
    machine.set_live_user_context(inc.user_context.clone());
    Ok(())
}

/// Switch from the running process to `inc`: save the live contexts and
/// the installed kernel-stack mapping into `out`, then install `inc`'s.
pub fn switch(
    machine: &mut Machine,
    region0: &mut PageTable,
    out: &mut ProcessControlBlock,
    inc: &mut ProcessControlBlock,
) -> Result<(), SwitchError> {
    out.kernel_context = machine.live_kernel_context().clone();
    out.user_context = machine.live_user_context().clone();
    for i in 0..KERNEL_STACK_PAGES {
        out.kernel_stack[i] = region0
            .get(KERNEL_STACK_BASE_PAGE + i)
            .unwrap_or(PageTableEntry::INVALID);
    }
    trace_printf!(3, "KCSWITCH: {} -> {}", out.pid, inc.pid);
    install_stack(machine, region0, inc)
}

/// Give `child` a kernel stack that is a byte-for-byte copy of the
/// running process's, in fresh frames, along with a copy of the live
/// kernel context. On frame exhaustion every frame taken so far is
/// returned and the child is untouched.
pub fn copy_for_fork(
    machine: &mut Machine,
    region0: &mut PageTable,
    frame_table: &mut FrameTable,
    child: &mut ProcessControlBlock,
) -> Result<(), SwitchError> {
    let mut frames = [0usize; KERNEL_STACK_PAGES];
    for i in 0..KERNEL_STACK_PAGES {
        match frame_table.allocate(if i == 0 { 0 } else { frames[i - 1] + 1 }) {
            Ok(pfn) => frames[i] = pfn,
            Err(_) => {
                for &f in &frames[..i] {
                    let _ = frame_table.free(f);
                }
                return Err(SwitchError::OutOfMemory);
            }
        }
    }

    let mut page = [0u8; PAGE_SIZE];
    for i in 0..KERNEL_STACK_PAGES {
        let vaddr = (KERNEL_STACK_BASE_PAGE + i) << PAGE_SHIFT;
        machine.read_bytes(region0, Region::Zero, vaddr, &mut page)?;
        let mut window = StagingWindow::map(machine, region0, frames[i]);
        window.write_page(&page)?;
        drop(window);
        child.kernel_stack[i] = PageTableEntry::mapped(frames[i], Protection::READ_WRITE);
    }
    child.kernel_context = machine.live_kernel_context().clone();
    trace_printf!(3, "KCCOPY: cloned kernel stack for {}", child.pid);
    Ok(())
}

/// Switch into `inc` from a process that is being destroyed: instead of
/// saving the outgoing stack mapping, free its frames. The caller has
/// already disposed of the outgoing PCB.
pub fn switch_delete(
    machine: &mut Machine,
    region0: &mut PageTable,
    frame_table: &mut FrameTable,
    inc: &mut ProcessControlBlock,
) -> Result<(), SwitchError> {
    for i in 0..KERNEL_STACK_PAGES {
        if let Some(pte) = region0.get(KERNEL_STACK_BASE_PAGE + i) {
            if pte.valid {
                let _ = frame_table.free(pte.pfn);
            }
        }
    }
    trace_printf!(3, "KCSWITCH_DELETE: -> {}", inc.pid);
    install_stack(machine, region0, inc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address_space::build_region0;

    fn setup() -> (Machine, FrameTable, PageTable) {
        let machine = Machine::new(64 * PAGE_SIZE);
        let mut ft = FrameTable::new(64);
        let region0 = build_region0(&mut ft).unwrap();
        (machine, ft, region0)
    }

    fn pcb_with_stack(pid: Pid, ft: &mut FrameTable) -> ProcessControlBlock {
        let mut pcb = ProcessControlBlock::new(pid, None);
        for i in 0..KERNEL_STACK_PAGES {
            let pfn = ft.allocate(0).unwrap();
            pcb.kernel_stack[i] = PageTableEntry::mapped(pfn, Protection::READ_WRITE);
        }
        pcb
    }

    #[test]
    fn switch_swaps_stack_mapping_and_contexts() {
        let (mut machine, mut ft, mut r0) = setup();
        let mut out = ProcessControlBlock::new(1, None);
        let mut inc = pcb_with_stack(2, &mut ft);
        inc.kernel_context.sp = 0xdead;

        let boot_stack: alloc::vec::Vec<_> = (0..KERNEL_STACK_PAGES)
            .map(|i| r0.get(KERNEL_STACK_BASE_PAGE + i).unwrap())
            .collect();

        switch(&mut machine, &mut r0, &mut out, &mut inc).unwrap();

        // Outgoing PCB captured the boot stack mapping.
        for i in 0..KERNEL_STACK_PAGES {
            assert_eq!(out.kernel_stack[i], boot_stack[i]);
            assert_eq!(
                r0.get(KERNEL_STACK_BASE_PAGE + i).unwrap(),
                inc.kernel_stack[i]
            );
        }
        assert_eq!(machine.live_kernel_context().sp, 0xdead);
    }

    #[test]
    fn switch_rejects_missing_stack() {
        let (mut machine, _ft, mut r0) = setup();
        let mut out = ProcessControlBlock::new(1, None);
        let mut inc = ProcessControlBlock::new(2, None);
        assert_eq!(
            switch(&mut machine, &mut r0, &mut out, &mut inc),
            Err(SwitchError::NoKernelStack(2))
        );
    }

    #[test]
    fn switch_flushes_stale_stack_translations() {
        let (mut machine, mut ft, mut r0) = setup();
        let mut out = ProcessControlBlock::new(1, None);
        let mut inc = pcb_with_stack(2, &mut ft);

        // Warm the TLB with the boot stack's translation.
        let vaddr = KERNEL_STACK_BASE_PAGE << PAGE_SHIFT;
        let old_pfn = machine.translate(&r0, Region::Zero, vaddr).unwrap();

        switch(&mut machine, &mut r0, &mut out, &mut inc).unwrap();
        let new_pfn = machine.translate(&r0, Region::Zero, vaddr).unwrap();
        assert_ne!(old_pfn, new_pfn);
        assert_eq!(new_pfn, inc.kernel_stack[0].pfn);
    }

    #[test]
    fn copy_for_fork_duplicates_stack_in_fresh_frames() {
        let (mut machine, mut ft, mut r0) = setup();
        let mut child = ProcessControlBlock::new(2, Some(1));

        // Put recognizable bytes on the live kernel stack.
        let vaddr = KERNEL_STACK_BASE_PAGE << PAGE_SHIFT;
        machine
            .write_bytes(&r0, Region::Zero, vaddr, b"stack frame")
            .unwrap();
        let live_pfn = r0.get(KERNEL_STACK_BASE_PAGE).unwrap().pfn;

        copy_for_fork(&mut machine, &mut r0, &mut ft, &mut child).unwrap();

        assert_ne!(child.kernel_stack[0].pfn, live_pfn);
        let copied = machine.frame(child.kernel_stack[0].pfn).unwrap();
        assert_eq!(&copied[..11], b"stack frame");
        // The live mapping is untouched.
        assert_eq!(r0.get(KERNEL_STACK_BASE_PAGE).unwrap().pfn, live_pfn);
    }

    #[test]
    fn copy_for_fork_rolls_back_on_exhaustion() {
        let mut machine = Machine::new(16 * PAGE_SIZE);
        let mut ft = FrameTable::new(16);
        let mut r0 = build_region0(&mut ft).unwrap();
        // Leave fewer free frames than the stack needs.
        while ft.count_free() >= KERNEL_STACK_PAGES {
            ft.allocate(0).unwrap();
        }
        let free_before = ft.count_free();
        let mut child = ProcessControlBlock::new(2, Some(1));
        assert_eq!(
            copy_for_fork(&mut machine, &mut r0, &mut ft, &mut child),
            Err(SwitchError::OutOfMemory)
        );
        assert_eq!(ft.count_free(), free_before);
        assert!(!child.kernel_stack[0].valid);
    }

    #[test]
    fn switch_delete_frees_outgoing_frames() {
        let (mut machine, mut ft, mut r0) = setup();
        let mut inc = pcb_with_stack(2, &mut ft);
        let free_before = ft.count_free();
        switch_delete(&mut machine, &mut r0, &mut ft, &mut inc).unwrap();
        // The boot stack's frames came back.
        assert_eq!(ft.count_free(), free_before + KERNEL_STACK_PAGES);
        assert_eq!(
            r0.get(KERNEL_STACK_BASE_PAGE).unwrap(),
            inc.kernel_stack[0]
        );
    }
}

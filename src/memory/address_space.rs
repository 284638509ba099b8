//! Address-space lifecycle: the boot-time kernel (region 0) layout,
//! per-process user (region 1) tables, heap growth and shrink, implicit
//! stack growth, the fork deep copy, and teardown.
//!
//! The fork copy and the kernel-stack clone both need to address two
//! physical frames at once through a single virtual window; [`StagingWindow`]
//! is the scoped mapping that makes that safe (map, copy, guaranteed unmap
//! and TLB flush on drop).

use alloc::vec::Vec;

use crate::hardware::{
    FrameId, Machine, MachineError, Region, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_PAGES,
    PAGE_SHIFT, PAGE_SIZE, REGION_PAGES, VMEM_1_BASE, VMEM_1_LIMIT,
};
use crate::memory::frame_table::{FrameError, FrameTable};
use crate::memory::page_table::{PageTable, PageTableEntry, Protection};
use crate::trace_printf;

/// Identity-mapped kernel text pages at the bottom of region 0.
pub const KERNEL_TEXT_PAGES: usize = 4;
/// Kernel text plus data; everything below this page is identity-mapped at
/// boot and never unmapped.
pub const KERNEL_DATA_PAGES: usize = 8;

/// How far below the current stack boundary a fault still counts as stack
/// growth.
pub const DEFAULT_STACK_GUARD_PAGES: usize = 16;

/// Scratch page used as a temporary alias window, just below the kernel
/// stack. Never valid outside a live [`StagingWindow`].
const STAGING_PAGE: usize = KERNEL_STACK_BASE_PAGE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrkError {
    /// Address outside region 1.
    InvalidAddress(usize),
    /// Below the floor established at load time.
    BelowFloor,
    /// Growth would run into the stack.
    CollidesWithStack,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    OutOfMemory,
    /// A memory fault that is not legitimate stack growth.
    NotStackGrowth(usize),
    Machine(MachineError),
}

impl From<MachineError> for AddressSpaceError {
    fn from(e: MachineError) -> Self {
        AddressSpaceError::Machine(e)
    }
}

impl From<FrameError> for AddressSpaceError {
    fn from(_: FrameError) -> Self {
        AddressSpaceError::OutOfMemory
    }
}

/// Build the region-0 table at boot: identity-map kernel text and data,
/// leave a guard gap, and allocate fresh frames for the kernel stack at the
/// fixed top pages.
pub fn build_region0(frame_table: &mut FrameTable) -> Result<PageTable, AddressSpaceError> {
    let mut table = PageTable::new(REGION_PAGES);
    for page in 0..KERNEL_DATA_PAGES {
        frame_table.claim(page)?;
        let prot = if page < KERNEL_TEXT_PAGES {
            Protection::READ_EXEC
        } else {
            Protection::READ_WRITE
        };
        table.set(page, PageTableEntry::mapped(page, prot));
    }
    for i in 0..KERNEL_STACK_PAGES {
        let pfn = frame_table.allocate(KERNEL_DATA_PAGES)?;
        table.set(
            KERNEL_STACK_BASE_PAGE + i,
            PageTableEntry::mapped(pfn, Protection::READ_WRITE),
        );
    }
    Ok(table)
}

/// A fresh, empty user table.
pub fn new_user_table() -> PageTable {
    PageTable::new(REGION_PAGES)
}

/// Lowest page of the contiguous valid run at the top of a user table,
/// i.e. the current stack boundary. A table with no stack maps to the
/// region size (no boundary).
pub fn stack_boundary_page(table: &PageTable) -> usize {
    let mut boundary = table.len();
    for vpn in (0..table.len()).rev() {
        match table.get(vpn) {
            Some(pte) if pte.valid => boundary = vpn,
            _ => break,
        }
    }
    boundary
}

/// Move the heap break. Growth is all-or-nothing (pre-checked against the
/// free-frame count); shrink frees page by page and cannot fail.
///
/// Returns the new break page on success. `brk_page` is the exclusive end
/// of the heap; `floor_page` is the load-time text+data end.
pub fn set_break(
    frame_table: &mut FrameTable,
    machine: &mut Machine,
    table: &mut PageTable,
    floor_page: usize,
    brk_page: usize,
    new_top: usize,
) -> Result<usize, BrkError> {
    if new_top < VMEM_1_BASE || new_top > VMEM_1_LIMIT {
        return Err(BrkError::InvalidAddress(new_top));
    }
    let new_brk_page = (new_top - VMEM_1_BASE + PAGE_SIZE - 1) >> PAGE_SHIFT;
    if new_brk_page < floor_page {
        return Err(BrkError::BelowFloor);
    }

    if new_brk_page > brk_page {
        // Growth: the heap's top page may reach one page below the stack
        // boundary, never the boundary itself.
        let boundary = stack_boundary_page(table);
        if new_brk_page > boundary {
            return Err(BrkError::CollidesWithStack);
        }
        let delta = new_brk_page - brk_page;
        if frame_table.count_free() < delta {
            return Err(BrkError::OutOfMemory);
        }
        let mut hint = 0;
        for vpn in brk_page..new_brk_page {
            // Pre-checked above; a failure here is a frame-table bug.
            let pfn = frame_table.allocate(hint).map_err(|_| BrkError::OutOfMemory)?;
            hint = pfn + 1;
            table.set(vpn, PageTableEntry::mapped(pfn, Protection::READ_WRITE));
        }
        trace_printf!(1, "SET_BREAK: grew heap by {} pages to page {}", delta, new_brk_page);
    } else {
        for vpn in new_brk_page..brk_page {
            if let Some(pte) = table.get(vpn) {
                if pte.valid {
                    table.invalidate(vpn);
                    machine.tlb().flush_page(Region::One, vpn);
                    // The entry was valid, so the frame must be in use.
                    let _ = frame_table.free(pte.pfn);
                }
            }
        }
        trace_printf!(1, "SET_BREAK: shrank heap to page {}", new_brk_page);
    }
    Ok(new_brk_page)
}

/// Grow the stack in response to a memory fault at `addr`, if the fault
/// lies within `guard_pages` below the current stack boundary and stays
/// clear of the heap top. Anything else is fatal to the process.
pub fn handle_stack_fault(
    frame_table: &mut FrameTable,
    table: &mut PageTable,
    brk_page: usize,
    addr: usize,
    guard_pages: usize,
) -> Result<(), AddressSpaceError> {
    let vpn = Region::One
        .vpn_of(addr)
        .ok_or(AddressSpaceError::NotStackGrowth(addr))?;
    let boundary = stack_boundary_page(table);
    let in_window = vpn < boundary && boundary - vpn <= guard_pages;
    // A fault at or below the break would merge stack into heap.
    if !in_window || vpn <= brk_page {
        return Err(AddressSpaceError::NotStackGrowth(addr));
    }
    let delta = boundary - vpn;
    if frame_table.count_free() < delta {
        return Err(AddressSpaceError::OutOfMemory);
    }
    let mut hint = 0;
    for page in vpn..boundary {
        let pfn = frame_table.allocate(hint)?;
        hint = pfn + 1;
        table.set(page, PageTableEntry::mapped(pfn, Protection::READ_WRITE));
    }
    trace_printf!(1, "STACK_FAULT: grew stack down {} pages to page {}", delta, vpn);
    Ok(())
}

/// Deep-copy every valid page of `src` into freshly allocated frames,
/// staging each copy through the scratch window. A mid-copy allocation
/// failure frees every frame taken so far and reports `OutOfMemory`; the
/// partially built table never escapes.
pub fn fork_copy(
    machine: &mut Machine,
    region0: &mut PageTable,
    frame_table: &mut FrameTable,
    src: &PageTable,
) -> Result<PageTable, AddressSpaceError> {
    let mut dst = PageTable::new(src.len());
    let mut taken: Vec<FrameId> = Vec::new();
    let mut page = [0u8; PAGE_SIZE];

    for (vpn, pte) in src.iter() {
        if !pte.valid {
            continue;
        }
        let pfn = match frame_table.allocate(taken.last().map(|p| p + 1).unwrap_or(0)) {
            Ok(pfn) => pfn,
            Err(_) => {
                for f in taken {
                    // Taken frames are necessarily in use.
                    let _ = frame_table.free(f);
                }
                trace_printf!(1, "FORK_COPY: out of frames, rolled back");
                return Err(AddressSpaceError::OutOfMemory);
            }
        };
        taken.push(pfn);

        machine.read_bytes(src, Region::One, VMEM_1_BASE + (vpn << PAGE_SHIFT), &mut page)?;
        let mut window = StagingWindow::map(machine, region0, pfn);
        window.write_page(&page)?;
        drop(window);

        dst.set(vpn, PageTableEntry::mapped(pfn, pte.prot));
    }
    Ok(dst)
}

/// Invalidate every entry of a user table and free the backing frames.
/// Callers hold the table in an `Option` and pass the result of `take()`,
/// so tearing down an already-torn-down (zombie) space is a no-op.
pub fn teardown(frame_table: &mut FrameTable, machine: &mut Machine, table: Option<PageTable>) {
    let Some(table) = table else { return };
    for (vpn, pte) in table.iter() {
        if pte.valid {
            let _ = frame_table.free(pte.pfn);
            machine.tlb().flush_page(Region::One, vpn);
        }
    }
    trace_printf!(5, "TEARDOWN: freed user table");
}

/// A scoped alias mapping of one physical frame through the scratch page
/// just below the kernel stack. The mapping (and its TLB entry) is
/// guaranteed gone when the window drops, even on an early return.
pub struct StagingWindow<'a> {
    machine: &'a mut Machine,
    region0: &'a mut PageTable,
    vpn: usize,
}

impl<'a> StagingWindow<'a> {
    pub fn map(machine: &'a mut Machine, region0: &'a mut PageTable, pfn: FrameId) -> Self {
        region0.set(STAGING_PAGE, PageTableEntry::mapped(pfn, Protection::READ_WRITE));
        // Kill any translation cached from a previous tenant before first use.
        machine.tlb().flush_page(Region::Zero, STAGING_PAGE);
        StagingWindow {
            machine,
            region0,
            vpn: STAGING_PAGE,
        }
    }

    /// Write a full page through the window's virtual alias.
    pub fn write_page(&mut self, bytes: &[u8; PAGE_SIZE]) -> Result<(), MachineError> {
        self.machine
            .write_bytes(self.region0, Region::Zero, self.vpn << PAGE_SHIFT, bytes)
    }
}

impl Drop for StagingWindow<'_> {
    fn drop(&mut self) {
        self.region0.invalidate(self.vpn);
        self.machine.tlb().flush_page(Region::Zero, self.vpn);
    }
}

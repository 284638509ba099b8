//! Simulated machine: physical memory, MMU registers, TLB, CPU context
//! blobs and terminal hardware.
//!
//! The kernel treats everything here as the hardware collaborator: it owns a
//! [`Machine`] handed to it at boot and talks to it the way the original
//! talks to the course hardware library (write a page-table base register,
//! flush a TLB range, start a terminal transmit). Translation consults the
//! TLB *before* the page table, so a kernel that forgets to flush after
//! remapping a page really does read or write through the stale entry.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use crate::memory::page_table::PageTable;

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SHIFT: usize = 12;

/// Region 0 (kernel) spans the bottom megabyte of the virtual space.
pub const VMEM_0_BASE: usize = 0x0;
pub const VMEM_0_SIZE: usize = 0x10_0000;
/// Region 1 (user) spans the next megabyte.
pub const VMEM_1_BASE: usize = VMEM_0_BASE + VMEM_0_SIZE;
pub const VMEM_1_SIZE: usize = 0x10_0000;
pub const VMEM_1_LIMIT: usize = VMEM_1_BASE + VMEM_1_SIZE;

/// Pages per region.
pub const REGION_PAGES: usize = VMEM_0_SIZE >> PAGE_SHIFT;

/// The kernel stack is a fixed set of pages at the very top of region 0,
/// remapped on every context switch.
pub const KERNEL_STACK_PAGES: usize = 2;
pub const KERNEL_STACK_BASE_PAGE: usize = REGION_PAGES - KERNEL_STACK_PAGES;

pub const TTY_COUNT: usize = 4;
/// Longest single hardware transmit; longer writes are chunked.
pub const TERMINAL_MAX_LINE: usize = 1024;
/// Capacity of a terminal's kernel-side input buffer.
pub const TTY_BUFFER_SIZE: usize = 2048;

pub const PIPE_BUFFER_LEN: usize = 256;

/// Physical frame number.
pub type FrameId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Region {
    Zero,
    One,
}

impl Region {
    pub fn base(self) -> usize {
        match self {
            Region::Zero => VMEM_0_BASE,
            Region::One => VMEM_1_BASE,
        }
    }

    /// Virtual page number of `addr` within this region, if `addr` lies in it.
    pub fn vpn_of(self, addr: usize) -> Option<usize> {
        let (base, limit) = match self {
            Region::Zero => (VMEM_0_BASE, VMEM_0_BASE + VMEM_0_SIZE),
            Region::One => (VMEM_1_BASE, VMEM_1_LIMIT),
        };
        if addr >= base && addr < limit {
            Some((addr - base) >> PAGE_SHIFT)
        } else {
            None
        }
    }
}

/// User-mode CPU state, saved and restored verbatim across scheduling.
/// `regs[0]` doubles as the syscall return register, as on the original
/// hardware.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub pc: usize,
    pub sp: usize,
    pub regs: [isize; 8],
    /// Faulting address, filled by the hardware on a memory trap.
    pub addr: usize,
    /// Trap-specific code, filled by the hardware.
    pub code: isize,
}

/// Kernel-mode register snapshot needed to resume a descheduled process in
/// the kernel. Opaque to everything but the context switch engine.
#[derive(Debug, Clone, Default)]
pub struct KernelContext {
    pub regs: [usize; 8],
    pub sp: usize,
    pub pc: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    /// Translation found no valid mapping for the page.
    TranslationFault { region: Region, addr: usize },
    /// Access to a physical frame outside installed memory.
    BadFrame(FrameId),
    /// Address outside the accessed region.
    BadAddress(usize),
    /// No such terminal.
    BadTty(usize),
}

/// Physical memory as an array of frames.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
    num_frames: usize,
}

impl PhysicalMemory {
    pub fn new(pmem_size: usize) -> Self {
        let num_frames = pmem_size / PAGE_SIZE;
        PhysicalMemory {
            bytes: vec![0; num_frames * PAGE_SIZE],
            num_frames,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn frame(&self, pfn: FrameId) -> Result<&[u8], MachineError> {
        if pfn >= self.num_frames {
            return Err(MachineError::BadFrame(pfn));
        }
        Ok(&self.bytes[pfn * PAGE_SIZE..(pfn + 1) * PAGE_SIZE])
    }

    pub fn frame_mut(&mut self, pfn: FrameId) -> Result<&mut [u8], MachineError> {
        if pfn >= self.num_frames {
            return Err(MachineError::BadFrame(pfn));
        }
        Ok(&mut self.bytes[pfn * PAGE_SIZE..(pfn + 1) * PAGE_SIZE])
    }
}

/// Translation lookaside buffer. Entries persist until explicitly flushed,
/// which is exactly what makes a missing flush a real bug in the simulation.
#[derive(Default)]
pub struct Tlb {
    entries: BTreeMap<(Region, usize), FrameId>,
}

impl Tlb {
    pub fn flush_all(&mut self) {
        self.entries.clear();
    }

    pub fn flush_region(&mut self, region: Region) {
        self.entries.retain(|(r, _), _| *r != region);
    }

    /// Flush the kernel-stack page range of region 0.
    pub fn flush_kstack(&mut self) {
        self.entries
            .retain(|(r, vpn), _| !(*r == Region::Zero && *vpn >= KERNEL_STACK_BASE_PAGE));
    }

    pub fn flush_page(&mut self, region: Region, vpn: usize) {
        self.entries.remove(&(region, vpn));
    }

    fn lookup(&self, region: Region, vpn: usize) -> Option<FrameId> {
        self.entries.get(&(region, vpn)).copied()
    }

    fn fill(&mut self, region: Region, vpn: usize, pfn: FrameId) {
        self.entries.insert((region, vpn), pfn);
    }
}

/// One terminal's hardware side: a single in-flight transmit, typed input
/// lines waiting for the receive trap, and a log of completed output.
struct TtyHardware {
    transmit_busy: bool,
    typed_lines: VecDeque<Vec<u8>>,
    output: Vec<Vec<u8>>,
}

impl TtyHardware {
    fn new() -> Self {
        TtyHardware {
            transmit_busy: false,
            typed_lines: VecDeque::new(),
            output: Vec::new(),
        }
    }
}

/// The simulated machine the kernel runs on.
pub struct Machine {
    pmem: PhysicalMemory,
    tlb: Tlb,
    /// Token naming the active region-1 table (the owning pid), the analog
    /// of the region-1 page-table base register.
    ptbr1: u32,
    live_kernel: KernelContext,
    live_user: UserContext,
    ttys: Vec<TtyHardware>,
}

impl Machine {
    pub fn new(pmem_size: usize) -> Self {
        let mut ttys = Vec::with_capacity(TTY_COUNT);
        for _ in 0..TTY_COUNT {
            ttys.push(TtyHardware::new());
        }
        Machine {
            pmem: PhysicalMemory::new(pmem_size),
            tlb: Tlb::default(),
            ptbr1: 0,
            live_kernel: KernelContext::default(),
            live_user: UserContext::default(),
            ttys,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.pmem.num_frames()
    }

    pub fn tlb(&mut self) -> &mut Tlb {
        &mut self.tlb
    }

    pub fn set_ptbr1(&mut self, token: u32) {
        self.ptbr1 = token;
    }

    pub fn ptbr1(&self) -> u32 {
        self.ptbr1
    }

    pub fn live_kernel_context(&self) -> &KernelContext {
        &self.live_kernel
    }

    pub fn set_live_kernel_context(&mut self, ctx: KernelContext) {
        self.live_kernel = ctx;
    }

    pub fn live_user_context(&self) -> &UserContext {
        &self.live_user
    }

    pub fn live_user_context_mut(&mut self) -> &mut UserContext {
        &mut self.live_user
    }

    pub fn set_live_user_context(&mut self, ctx: UserContext) {
        self.live_user = ctx;
    }

    /// Translate a virtual address through the TLB, falling back to the
    /// given page table on a miss. The table must be the one the MMU
    /// registers currently name; a stale TLB entry wins, by construction.
    pub fn translate(
        &mut self,
        table: &PageTable,
        region: Region,
        addr: usize,
    ) -> Result<FrameId, MachineError> {
        let vpn = region
            .vpn_of(addr)
            .ok_or(MachineError::BadAddress(addr))?;
        if let Some(pfn) = self.tlb.lookup(region, vpn) {
            return Ok(pfn);
        }
        let pte = table
            .get(vpn)
            .ok_or(MachineError::BadAddress(addr))?;
        if !pte.valid {
            return Err(MachineError::TranslationFault { region, addr });
        }
        self.tlb.fill(region, vpn, pte.pfn);
        Ok(pte.pfn)
    }

    /// Copy `out.len()` bytes from virtual memory, walking pages as needed.
    pub fn read_bytes(
        &mut self,
        table: &PageTable,
        region: Region,
        addr: usize,
        out: &mut [u8],
    ) -> Result<(), MachineError> {
        let mut done = 0;
        while done < out.len() {
            let va = addr + done;
            let pfn = self.translate(table, region, va)?;
            let off = va & (PAGE_SIZE - 1);
            let n = core::cmp::min(PAGE_SIZE - off, out.len() - done);
            let frame = self.pmem.frame(pfn)?;
            out[done..done + n].copy_from_slice(&frame[off..off + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `data` into virtual memory, walking pages as needed.
    pub fn write_bytes(
        &mut self,
        table: &PageTable,
        region: Region,
        addr: usize,
        data: &[u8],
    ) -> Result<(), MachineError> {
        let mut done = 0;
        while done < data.len() {
            let va = addr + done;
            let pfn = self.translate(table, region, va)?;
            let off = va & (PAGE_SIZE - 1);
            let n = core::cmp::min(PAGE_SIZE - off, data.len() - done);
            let frame = self.pmem.frame_mut(pfn)?;
            frame[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Direct frame access for the bootloader/loader collaborator, which
    /// populates pages before any mapping is live.
    pub fn frame_mut(&mut self, pfn: FrameId) -> Result<&mut [u8], MachineError> {
        self.pmem.frame_mut(pfn)
    }

    pub fn frame(&self, pfn: FrameId) -> Result<&[u8], MachineError> {
        self.pmem.frame(pfn)
    }

    // ---- terminal hardware ----

    /// Start a hardware transmit. The terminal stays busy until the
    /// transmit trap fires (driven by `tty_finish_transmit`).
    pub fn tty_transmit(&mut self, id: usize, bytes: &[u8]) -> Result<(), MachineError> {
        let tty = self.ttys.get_mut(id).ok_or(MachineError::BadTty(id))?;
        tty.transmit_busy = true;
        tty.output.push(bytes.to_vec());
        Ok(())
    }

    pub fn tty_transmit_busy(&self, id: usize) -> bool {
        self.ttys.get(id).map(|t| t.transmit_busy).unwrap_or(false)
    }

    /// Hardware-side completion of the in-flight transmit. The embedder (or
    /// a test) calls this, then delivers the transmit trap to the kernel.
    pub fn tty_finish_transmit(&mut self, id: usize) -> Result<(), MachineError> {
        let tty = self.ttys.get_mut(id).ok_or(MachineError::BadTty(id))?;
        tty.transmit_busy = false;
        Ok(())
    }

    /// Everything transmitted on a terminal so far, in order.
    pub fn tty_output(&self, id: usize) -> &[Vec<u8>] {
        self.ttys.get(id).map(|t| t.output.as_slice()).unwrap_or(&[])
    }

    /// Type a line at a terminal. The embedder then delivers the receive
    /// trap, and the kernel consumes the line with `tty_take_line`.
    pub fn tty_type_line(&mut self, id: usize, line: &[u8]) -> Result<(), MachineError> {
        let tty = self.ttys.get_mut(id).ok_or(MachineError::BadTty(id))?;
        tty.typed_lines.push_back(line.to_vec());
        Ok(())
    }

    pub fn tty_take_line(&mut self, id: usize) -> Option<Vec<u8>> {
        self.ttys.get_mut(id).and_then(|t| t.typed_lines.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_table::{PageTable, PageTableEntry, Protection};

    fn table_with_page(vpn: usize, pfn: FrameId) -> PageTable {
        let mut t = PageTable::new(REGION_PAGES);
        t.set(vpn, PageTableEntry::mapped(pfn, Protection::READ_WRITE));
        t
    }

    #[test]
    fn translate_fills_and_uses_tlb() {
        let mut m = Machine::new(64 * PAGE_SIZE);
        let mut table = table_with_page(3, 7);
        let addr = VMEM_1_BASE + 3 * PAGE_SIZE + 5;
        assert_eq!(m.translate(&table, Region::One, addr).unwrap(), 7);

        // Remap without flushing: the stale TLB entry must win.
        table.set(3, PageTableEntry::mapped(9, Protection::READ_WRITE));
        assert_eq!(m.translate(&table, Region::One, addr).unwrap(), 7);

        m.tlb().flush_page(Region::One, 3);
        assert_eq!(m.translate(&table, Region::One, addr).unwrap(), 9);
    }

    #[test]
    fn read_write_cross_page() {
        let mut m = Machine::new(64 * PAGE_SIZE);
        let mut table = PageTable::new(REGION_PAGES);
        table.set(0, PageTableEntry::mapped(10, Protection::READ_WRITE));
        table.set(1, PageTableEntry::mapped(11, Protection::READ_WRITE));

        let addr = VMEM_1_BASE + PAGE_SIZE - 2;
        m.write_bytes(&table, Region::One, addr, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 4];
        m.read_bytes(&table, Region::One, addr, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
        // The bytes really straddled two frames.
        assert_eq!(m.frame(10).unwrap()[PAGE_SIZE - 1], 2);
        assert_eq!(m.frame(11).unwrap()[0], 3);
    }

    #[test]
    fn translation_fault_on_invalid_page() {
        let mut m = Machine::new(64 * PAGE_SIZE);
        let table = PageTable::new(REGION_PAGES);
        let err = m
            .translate(&table, Region::One, VMEM_1_BASE + PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(err, MachineError::TranslationFault { .. }));
    }
}

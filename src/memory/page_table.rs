//! Page-table entries and the per-region tables built from them.

use alloc::vec;
use alloc::vec::Vec;

use crate::hardware::FrameId;

/// Page protection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const NONE: Protection = Protection {
        read: false,
        write: false,
        exec: false,
    };
    pub const READ: Protection = Protection {
        read: true,
        write: false,
        exec: false,
    };
    pub const READ_WRITE: Protection = Protection {
        read: true,
        write: true,
        exec: false,
    };
    pub const READ_EXEC: Protection = Protection {
        read: true,
        write: false,
        exec: true,
    };

    /// Does this protection satisfy every bit `needed` asks for?
    pub fn allows(&self, needed: Protection) -> bool {
        (!needed.read || self.read)
            && (!needed.write || self.write)
            && (!needed.exec || self.exec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub valid: bool,
    pub prot: Protection,
    pub pfn: FrameId,
}

impl PageTableEntry {
    pub const INVALID: PageTableEntry = PageTableEntry {
        valid: false,
        prot: Protection::NONE,
        pfn: 0,
    };

    pub fn mapped(pfn: FrameId, prot: Protection) -> Self {
        PageTableEntry {
            valid: true,
            prot,
            pfn,
        }
    }
}

/// One region's page table: a dense array of entries indexed by virtual
/// page number within the region. Region-1 tables are owned exclusively by
/// their process's PCB.
#[derive(Debug)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    pub fn new(num_pages: usize) -> Self {
        PageTable {
            entries: vec![PageTableEntry::INVALID; num_pages],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, vpn: usize) -> Option<PageTableEntry> {
        self.entries.get(vpn).copied()
    }

    pub fn set(&mut self, vpn: usize, pte: PageTableEntry) {
        self.entries[vpn] = pte;
    }

    pub fn invalidate(&mut self, vpn: usize) {
        self.entries[vpn] = PageTableEntry::INVALID;
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }

    /// Number of valid entries; fork's atomic pre-check uses this.
    pub fn count_valid(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }
}

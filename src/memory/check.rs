//! Validation of user-supplied pointers before the kernel dereferences
//! them. Every syscall argument that names user memory goes through here
//! first; a pointer that fails is a syscall error, never a kernel fault.

use alloc::vec::Vec;

use crate::hardware::{Machine, Region, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::page_table::{PageTable, Protection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// Outside region 1, or an unmapped page.
    BadPointer(usize),
    /// Mapped, but without the access the caller needs.
    Protection(usize),
    /// A string ran past the length cap without a NUL.
    Unterminated(usize),
}

impl core::fmt::Display for CheckError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CheckError::BadPointer(a) => write!(f, "bad user pointer {:#x}", a),
            CheckError::Protection(a) => write!(f, "protection violation at {:#x}", a),
            CheckError::Unterminated(a) => write!(f, "unterminated string at {:#x}", a),
        }
    }
}

fn check_page(table: &PageTable, vpn: usize, needed: Protection, addr: usize) -> Result<(), CheckError> {
    let pte = table.get(vpn).ok_or(CheckError::BadPointer(addr))?;
    if !pte.valid {
        return Err(CheckError::BadPointer(addr));
    }
    if !pte.prot.allows(needed) {
        return Err(CheckError::Protection(addr));
    }
    Ok(())
}

/// Check that `len` bytes starting at `addr` are mapped in region 1 with
/// at least `needed` access. A zero-length buffer is fine at any address.
pub fn check_buffer(
    table: &PageTable,
    addr: usize,
    len: usize,
    needed: Protection,
) -> Result<(), CheckError> {
    if len == 0 {
        return Ok(());
    }
    let first = Region::One.vpn_of(addr).ok_or(CheckError::BadPointer(addr))?;
    let end = addr
        .checked_add(len - 1)
        .ok_or(CheckError::BadPointer(addr))?;
    let last = Region::One.vpn_of(end).ok_or(CheckError::BadPointer(end))?;
    for vpn in first..=last {
        check_page(table, vpn, needed, addr + ((vpn - first) << PAGE_SHIFT))?;
    }
    Ok(())
}

/// Read a NUL-terminated string out of user memory, validating each page
/// as the walk reaches it.
pub fn read_string(
    machine: &mut Machine,
    table: &PageTable,
    addr: usize,
    max: usize,
) -> Result<Vec<u8>, CheckError> {
    let mut out = Vec::new();
    let mut pos = addr;
    while out.len() <= max {
        let vpn = Region::One.vpn_of(pos).ok_or(CheckError::BadPointer(pos))?;
        check_page(table, vpn, Protection::READ, pos)?;
        let page_end = ((vpn + 1) << PAGE_SHIFT) + Region::One.base();
        let chunk = core::cmp::min(page_end - pos, max + 1 - out.len());
        let mut buf = [0u8; PAGE_SIZE];
        machine
            .read_bytes(table, Region::One, pos, &mut buf[..chunk])
            .map_err(|_| CheckError::BadPointer(pos))?;
        if let Some(nul) = buf[..chunk].iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..nul]);
            return Ok(out);
        }
        out.extend_from_slice(&buf[..chunk]);
        pos += chunk;
    }
    Err(CheckError::Unterminated(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Machine, VMEM_1_BASE};
    use crate::memory::page_table::PageTableEntry;

    fn table_with(pages: &[(usize, Protection)]) -> PageTable {
        let mut t = PageTable::new(crate::hardware::REGION_PAGES);
        for (i, &(vpn, prot)) in pages.iter().enumerate() {
            t.set(vpn, PageTableEntry::mapped(i, prot));
        }
        t
    }

    #[test]
    fn buffer_spanning_mapped_pages_passes() {
        let t = table_with(&[(0, Protection::READ_WRITE), (1, Protection::READ_WRITE)]);
        check_buffer(&t, VMEM_1_BASE + PAGE_SIZE - 8, 16, Protection::READ_WRITE).unwrap();
    }

    #[test]
    fn buffer_touching_unmapped_page_fails() {
        let t = table_with(&[(0, Protection::READ_WRITE)]);
        let err = check_buffer(&t, VMEM_1_BASE + PAGE_SIZE - 8, 16, Protection::READ).unwrap_err();
        assert!(matches!(err, CheckError::BadPointer(_)));
    }

    #[test]
    fn buffer_length_wrapping_the_address_space_fails() {
        let t = table_with(&[(0, Protection::READ_WRITE)]);
        let err = check_buffer(&t, VMEM_1_BASE, usize::MAX, Protection::READ).unwrap_err();
        assert!(matches!(err, CheckError::BadPointer(_)));
        let err = check_buffer(&t, VMEM_1_BASE + 8, usize::MAX - 4, Protection::READ).unwrap_err();
        assert!(matches!(err, CheckError::BadPointer(_)));
    }

    #[test]
    fn write_through_read_only_page_fails() {
        let t = table_with(&[(0, Protection::READ)]);
        assert!(check_buffer(&t, VMEM_1_BASE, 4, Protection::READ).is_ok());
        let err = check_buffer(&t, VMEM_1_BASE, 4, Protection::READ_WRITE).unwrap_err();
        assert!(matches!(err, CheckError::Protection(_)));
    }

    #[test]
    fn string_walk_stops_at_nul_across_pages() {
        let mut machine = Machine::new(8 * PAGE_SIZE);
        let t = table_with(&[(0, Protection::READ_WRITE), (1, Protection::READ_WRITE)]);
        let addr = VMEM_1_BASE + PAGE_SIZE - 3;
        machine.write_bytes(&t, Region::One, addr, b"hello\0").unwrap();
        let s = read_string(&mut machine, &t, addr, 64).unwrap();
        assert_eq!(s, b"hello");
    }

    #[test]
    fn string_without_nul_is_rejected() {
        let mut machine = Machine::new(8 * PAGE_SIZE);
        let t = table_with(&[(0, Protection::READ_WRITE)]);
        machine
            .write_bytes(&t, Region::One, VMEM_1_BASE, &[b'x'; 32])
            .unwrap();
        let err = read_string(&mut machine, &t, VMEM_1_BASE, 8).unwrap_err();
        assert!(matches!(err, CheckError::Unterminated(_)));
    }
}

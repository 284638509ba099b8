//! Bitmap allocator over physical frames.
//!
//! A frame is used iff exactly one valid page-table entry (kernel or some
//! user table) maps it; allocation and free are the only mutators. The
//! first-fit scan wraps around from the hint back to frame 0, so a request
//! fails only when memory is genuinely exhausted.

use alloc::vec;
use alloc::vec::Vec;

use crate::hardware::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    OutOfMemory,
    /// Freeing a frame that is already free, a lifecycle bug.
    AlreadyFree(FrameId),
    OutOfRange(FrameId),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            FrameError::OutOfMemory => write!(f, "out of physical frames"),
            FrameError::AlreadyFree(n) => write!(f, "frame {} double-freed", n),
            FrameError::OutOfRange(n) => write!(f, "frame {} outside physical memory", n),
        }
    }
}

pub struct FrameTable {
    used: Vec<bool>,
}

impl FrameTable {
    pub fn new(num_frames: usize) -> Self {
        FrameTable {
            used: vec![false; num_frames],
        }
    }

    pub fn total(&self) -> usize {
        self.used.len()
    }

    /// First-fit scan from `hint`, wrapping to 0. Marks the frame used.
    pub fn allocate(&mut self, hint: FrameId) -> Result<FrameId, FrameError> {
        let n = self.used.len();
        if n == 0 {
            return Err(FrameError::OutOfMemory);
        }
        let start = if hint < n { hint } else { 0 };
        for i in (start..n).chain(0..start) {
            if !self.used[i] {
                self.used[i] = true;
                return Ok(i);
            }
        }
        Err(FrameError::OutOfMemory)
    }

    /// Claim a specific frame; boot uses this for identity-mapped kernel
    /// pages.
    pub fn claim(&mut self, frame: FrameId) -> Result<(), FrameError> {
        match self.used.get(frame) {
            None => Err(FrameError::OutOfRange(frame)),
            Some(true) => Err(FrameError::OutOfMemory),
            Some(false) => {
                self.used[frame] = true;
                Ok(())
            }
        }
    }

    pub fn free(&mut self, frame: FrameId) -> Result<(), FrameError> {
        match self.used.get(frame) {
            None => Err(FrameError::OutOfRange(frame)),
            Some(false) => Err(FrameError::AlreadyFree(frame)),
            Some(true) => {
                self.used[frame] = false;
                Ok(())
            }
        }
    }

    pub fn count_free(&self) -> usize {
        self.used.iter().filter(|u| !**u).count()
    }

    pub fn count_used(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_across_allocate_free() {
        let mut ft = FrameTable::new(16);
        let a = ft.allocate(0).unwrap();
        let b = ft.allocate(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(ft.count_free() + ft.count_used(), 16);
        ft.free(a).unwrap();
        assert_eq!(ft.count_free() + ft.count_used(), 16);
        assert_eq!(ft.count_used(), 1);
    }

    #[test]
    fn scan_wraps_below_hint() {
        let mut ft = FrameTable::new(4);
        // Fill everything, then free only frame 1.
        for _ in 0..4 {
            ft.allocate(0).unwrap();
        }
        ft.free(1).unwrap();
        // A hint past the free frame must still find it.
        assert_eq!(ft.allocate(3).unwrap(), 1);
        assert_eq!(ft.allocate(0), Err(FrameError::OutOfMemory));
    }

    #[test]
    fn double_free_is_detected() {
        let mut ft = FrameTable::new(4);
        let f = ft.allocate(0).unwrap();
        ft.free(f).unwrap();
        assert_eq!(ft.free(f), Err(FrameError::AlreadyFree(f)));
        assert_eq!(ft.free(99), Err(FrameError::OutOfRange(99)));
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut ft = FrameTable::new(2);
        ft.allocate(0).unwrap();
        ft.allocate(0).unwrap();
        assert_eq!(ft.allocate(0), Err(FrameError::OutOfMemory));
    }
}

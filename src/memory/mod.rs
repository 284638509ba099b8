//! Memory management: the physical frame bitmap, page tables for both
//! regions, address-space lifecycle (brk, stack growth, fork copy,
//! teardown) and user-pointer validation.

pub mod address_space;
pub mod check;
pub mod frame_table;
pub mod page_table;

pub use address_space::{AddressSpaceError, BrkError, StagingWindow};
pub use check::CheckError;
pub use frame_table::{FrameError, FrameTable};
pub use page_table::{PageTable, PageTableEntry, Protection};

//! Program loading: building a fresh region-1 image for exec and for the
//! first process at boot. Programs come from a registry of named images
//! rather than a filesystem.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::hardware::{
    Machine, MachineError, PAGE_SHIFT, PAGE_SIZE, REGION_PAGES, VMEM_1_BASE, VMEM_1_LIMIT,
};
use crate::memory::{FrameTable, PageTable, PageTableEntry, Protection};
use crate::process::ProcessControlBlock;
use crate::trace_printf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    ProgramNotFound,
    /// Image too big for region 1 alongside the stack.
    TooLarge,
    OutOfMemory,
    Machine(MachineError),
}

impl From<MachineError> for LoadError {
    fn from(e: MachineError) -> Self {
        LoadError::Machine(e)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::ProgramNotFound => write!(f, "program not found"),
            LoadError::TooLarge => write!(f, "program image too large"),
            LoadError::OutOfMemory => write!(f, "out of frames loading program"),
            LoadError::Machine(e) => write!(f, "machine error loading program: {:?}", e),
        }
    }
}

/// A loadable image: read-exec text followed by read-write data.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
}

/// Builds region-1 address spaces from named images. Replaces whatever
/// space the PCB had; callers tear the old one down first.
pub trait ProgramLoader {
    fn load(
        &self,
        machine: &mut Machine,
        frame_table: &mut FrameTable,
        pcb: &mut ProcessControlBlock,
        name: &str,
        args: &[Vec<u8>],
    ) -> Result<(), LoadError>;
}

/// The registry-backed loader used at boot and by exec.
#[derive(Default)]
pub struct ImageRegistry {
    programs: BTreeMap<String, Program>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        ImageRegistry {
            programs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, program: Program) {
        self.programs.insert(String::from(name), program);
    }
}

fn pages_for(len: usize) -> usize {
    (len + PAGE_SIZE - 1) >> PAGE_SHIFT
}

impl ProgramLoader for ImageRegistry {
    fn load(
        &self,
        machine: &mut Machine,
        frame_table: &mut FrameTable,
        pcb: &mut ProcessControlBlock,
        name: &str,
        args: &[Vec<u8>],
    ) -> Result<(), LoadError> {
        let program = self.programs.get(name).ok_or(LoadError::ProgramNotFound)?;

        let text_pages = core::cmp::max(1, pages_for(program.text.len()));
        let data_pages = pages_for(program.data.len());
        let floor = text_pages + data_pages;
        // Text, data, one stack page, and at least one page between heap
        // and stack.
        if floor + 2 > REGION_PAGES {
            return Err(LoadError::TooLarge);
        }
        let needed = floor + 1;
        if frame_table.count_free() < needed {
            return Err(LoadError::OutOfMemory);
        }

        let mut table = PageTable::new(REGION_PAGES);
        let mut frames: Vec<usize> = Vec::with_capacity(needed);
        let take = |ft: &mut FrameTable, frames: &mut Vec<usize>| -> Result<usize, LoadError> {
            let pfn = ft
                .allocate(frames.last().map(|p| p + 1).unwrap_or(0))
                .map_err(|_| LoadError::OutOfMemory)?;
            frames.push(pfn);
            Ok(pfn)
        };

        // Image pages, bottom up. Frames are written directly; the table
        // is not live in the MMU yet.
        for vpn in 0..floor {
            let pfn = take(frame_table, &mut frames)?;
            let (src, base, prot) = if vpn < text_pages {
                (&program.text, vpn << PAGE_SHIFT, Protection::READ_EXEC)
            } else {
                (
                    &program.data,
                    (vpn - text_pages) << PAGE_SHIFT,
                    Protection::READ_WRITE,
                )
            };
            let frame = machine.frame_mut(pfn)?;
            frame.fill(0);
            if base < src.len() {
                let n = core::cmp::min(PAGE_SIZE, src.len() - base);
                frame[..n].copy_from_slice(&src[base..base + n]);
            }
            table.set(vpn, PageTableEntry::mapped(pfn, prot));
        }

        // One stack page at the very top, with the argument strings
        // packed at its high end.
        let stack_pfn = take(frame_table, &mut frames)?;
        table.set(
            REGION_PAGES - 1,
            PageTableEntry::mapped(stack_pfn, Protection::READ_WRITE),
        );
        let args_len: usize = args.iter().map(|a| a.len() + 1).sum();
        if args_len > PAGE_SIZE / 2 {
            for pfn in frames {
                let _ = frame_table.free(pfn);
            }
            return Err(LoadError::TooLarge);
        }
        {
            let frame = machine.frame_mut(stack_pfn)?;
            frame.fill(0);
            let mut off = PAGE_SIZE - args_len;
            for arg in args {
                frame[off..off + arg.len()].copy_from_slice(arg);
                frame[off + arg.len()] = 0;
                off += arg.len() + 1;
            }
        }

        pcb.region1 = Some(table);
        pcb.brk_floor_page = floor;
        pcb.brk_page = floor;
        let args_base = VMEM_1_LIMIT - args_len;
        pcb.user_context = Default::default();
        pcb.user_context.pc = VMEM_1_BASE;
        // Stack pointer starts just below the argument block.
        pcb.user_context.sp = (args_base & !7) - 8;
        pcb.user_context.regs[0] = args.len() as isize;
        pcb.user_context.regs[1] = args_base as isize;
        trace_printf!(
            1,
            "LOAD: '{}' for pid {}: {} text + {} data pages, {} args",
            name,
            pcb.pid,
            text_pages,
            data_pages,
            args.len()
        );
        Ok(())
    }
}

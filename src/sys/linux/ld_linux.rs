//! ELF objects loaded by the dynamic linker.
//!
//! Each object's GOT slots are collected from its `JUMP_SLOT` and `GLOB_DAT`
//! relocations and grouped into contiguous runs, one [`PointerTable`] per run.

use crate::image::{Image, PointerTable};
use goblin::elf::dynamic::{DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELASZ};
use goblin::elf::program_header::{PT_DYNAMIC, PT_GNU_RELRO};
use goblin::elf64::dynamic::Dyn;
use goblin::elf64::reloc::Rela;
use std::ffi::CStr;
use std::ops::Range;
use tracing::trace;

#[cfg(target_arch = "x86_64")]
use goblin::elf::reloc::{R_X86_64_GLOB_DAT as R_GLOB_DAT, R_X86_64_JUMP_SLOT as R_JUMP_SLOT};

#[cfg(target_arch = "aarch64")]
use goblin::elf::reloc::{R_AARCH64_GLOB_DAT as R_GLOB_DAT, R_AARCH64_JUMP_SLOT as R_JUMP_SLOT};

/// A contiguous run of GOT slots.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SlotRun {
    start: usize,
    len: usize,
    read_only: bool,
}

/// A loaded ELF object and the GOT slots its relocations name.
#[derive(Debug)]
pub struct ElfImage {
    name: String,
    base: usize,
    runs: Vec<SlotRun>,
}

impl ElfImage {
    pub fn base(&self) -> usize {
        self.base
    }

    /// Build from the dynamic linker's description of one loaded object.
    ///
    /// # Safety
    ///
    /// `info` must come from `dl_iterate_phdr`, so that its program headers
    /// and dynamic section are mapped.
    unsafe fn from_phdr_info(info: &libc::dl_phdr_info) -> Option<Self> {
        let base = info.dlpi_addr as usize;
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }
                .to_string_lossy()
                .into_owned()
        };
        let name = if name.is_empty() {
            std::env::current_exe()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|_| "<main>".to_string())
        } else {
            name
        };

        if info.dlpi_phdr.is_null() {
            return None;
        }
        let phdrs = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        let mut dynamic = None;
        let mut relro: Vec<Range<usize>> = Vec::new();
        for phdr in phdrs {
            let start = base.wrapping_add(phdr.p_vaddr as usize);
            match phdr.p_type {
                PT_DYNAMIC => dynamic = Some(start as *const Dyn),
                // The linker only protects whole pages of the RELRO range.
                PT_GNU_RELRO => relro.push(page_down(start)..page_down(start + phdr.p_memsz as usize)),
                _ => {}
            }
        }
        let Some(dynamic) = dynamic else {
            return Some(Self {
                name,
                base,
                runs: Vec::new(),
            });
        };

        let relocated = |ptr: u64| {
            let ptr = ptr as usize;
            if ptr < base { base + ptr } else { ptr }
        };

        let mut rela = None;
        let mut rela_size = 0;
        let mut jmprel = None;
        let mut jmprel_size = 0;
        let mut pltrel = DT_RELA;
        let mut entry = dynamic;
        loop {
            let dyn_ = unsafe { std::ptr::read(entry) };
            match dyn_.d_tag {
                DT_NULL => break,
                DT_RELA => rela = Some(relocated(dyn_.d_val)),
                DT_RELASZ => rela_size = dyn_.d_val as usize,
                DT_JMPREL => jmprel = Some(relocated(dyn_.d_val)),
                DT_PLTRELSZ => jmprel_size = dyn_.d_val as usize,
                DT_PLTREL => pltrel = dyn_.d_val,
                _ => {}
            }
            entry = unsafe { entry.add(1) };
        }

        let mut slots = Vec::new();
        let mut tables = vec![(rela, rela_size)];
        if pltrel == DT_RELA {
            tables.push((jmprel, jmprel_size));
        }
        for (table, size) in tables {
            let Some(table) = table else { continue };
            let count = size / std::mem::size_of::<Rela>();
            let relocs = unsafe { std::slice::from_raw_parts(table as *const Rela, count) };
            for reloc in relocs {
                let kind = (reloc.r_info & 0xffff_ffff) as u32;
                if kind == R_JUMP_SLOT || kind == R_GLOB_DAT {
                    let slot = base.wrapping_add(reloc.r_offset as usize);
                    let read_only = relro.iter().any(|range| range.contains(&slot));
                    slots.push((slot, read_only));
                }
            }
        }

        let runs = group_runs(slots);
        trace!("{name}: {} GOT runs", runs.len());
        Some(Self { name, base, runs })
    }
}

fn page_down(addr: usize) -> usize {
    addr & !(crate::sys::page_size() - 1)
}

/// Sort slot addresses and merge adjacent slots with the same protection.
fn group_runs(mut slots: Vec<(usize, bool)>) -> Vec<SlotRun> {
    let word = std::mem::size_of::<usize>();
    slots.sort_unstable();
    slots.dedup_by_key(|(addr, _)| *addr);
    let mut runs: Vec<SlotRun> = Vec::new();
    for (addr, read_only) in slots {
        match runs.last_mut() {
            Some(run) if run.read_only == read_only && run.start + run.len * word == addr => {
                run.len += 1;
            }
            _ => runs.push(SlotRun {
                start: addr,
                len: 1,
                read_only,
            }),
        }
    }
    runs
}

impl Image for ElfImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn pointer_tables(&self) -> Vec<PointerTable> {
        self.runs
            .iter()
            .filter_map(|run| unsafe {
                PointerTable::from_raw(".got", run.start as *mut usize, run.len, run.read_only)
            })
            .collect()
    }
}

unsafe extern "C" fn collect(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let images = unsafe { &mut *(data as *mut Vec<ElfImage>) };
    if let Some(info) = unsafe { info.as_ref() } {
        if let Some(image) = unsafe { ElfImage::from_phdr_info(info) } {
            images.push(image);
        }
    }
    0
}

fn elf_images() -> Vec<ElfImage> {
    let mut images: Vec<ElfImage> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut images as *mut Vec<ElfImage> as *mut libc::c_void);
    }
    images
}

/// Every object currently loaded, main program first.
pub fn loaded_images() -> Vec<Box<dyn Image>> {
    elf_images()
        .into_iter()
        .map(|image| Box::new(image) as Box<dyn Image>)
        .collect()
}

pub fn main_image() -> Option<Box<dyn Image>> {
    elf_images()
        .into_iter()
        .next()
        .map(|image| Box::new(image) as Box<dyn Image>)
}

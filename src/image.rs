//! Image walker.
//!
//! A loaded image is a module mapped by the dynamic loader. The patch engine
//! only needs one thing from it: the list of symbol-pointer tables, i.e. the
//! memory slots the loader filled with resolved function addresses. This
//! module turns raw image memory into bounds-checked [`PointerTable`] views so
//! that all pointer arithmetic stays here.

use crate::macho::*;
use std::fmt;
use std::ptr::NonNull;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a 64-bit Mach-O image (magic {0:#x})")]
    BadMagic(u32),
    #[error("load command at offset {0} runs past the load command area")]
    Truncated(usize),
}

/// Something mapped by the dynamic loader that may contain symbol pointers.
pub trait Image: Send + Sync {
    fn name(&self) -> &str;

    /// Every symbol-pointer table in the image, in load-command order.
    fn pointer_tables(&self) -> Vec<PointerTable>;
}

/// A contiguous run of pointer-sized slots inside a mapped image.
pub struct PointerTable {
    section: String,
    base: NonNull<usize>,
    len: usize,
    read_only: bool,
}

// SAFETY: the table only refers to loader-owned memory that outlives the
// process' use of it. Stores to read-only pages go through
// `sys::write_protected`, which holds a process-wide lock across the
// unprotect, store and reprotect.
unsafe impl Send for PointerTable {}
unsafe impl Sync for PointerTable {}

impl PointerTable {
    /// Describe `len` slots starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be pointer-aligned and `len` slots from it must be mapped
    /// for as long as the table is used. `read_only` must reflect whether the
    /// pages are currently mapped without write permission.
    pub unsafe fn from_raw(
        section: impl Into<String>,
        base: *mut usize,
        len: usize,
        read_only: bool,
    ) -> Option<Self> {
        if base.align_offset(std::mem::align_of::<usize>()) != 0 {
            return None;
        }
        Some(Self {
            section: section.into(),
            base: NonNull::new(base)?,
            len,
            read_only,
        })
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn slot_addr(&self, index: usize) -> Option<usize> {
        (index < self.len).then(|| self.base.as_ptr() as usize + index * std::mem::size_of::<usize>())
    }

    /// Current value of slot `index`.
    pub fn load(&self, index: usize) -> Option<usize> {
        if index >= self.len {
            return None;
        }
        // SAFETY: bounds checked above; the slot is mapped per `from_raw`.
        Some(unsafe { std::ptr::read_volatile(self.base.as_ptr().add(index)) })
    }

    /// Overwrite slot `index`.
    ///
    /// Read-only slots are made writable for the duration of the single store
    /// and put back to read-only right after.
    pub fn store(&self, index: usize, value: usize) -> std::io::Result<()> {
        if index >= self.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "slot index out of range",
            ));
        }
        // SAFETY: bounds checked above.
        let slot = unsafe { self.base.as_ptr().add(index) };
        if self.read_only {
            crate::sys::write_protected(slot, value)
        } else {
            // SAFETY: the slot is mapped writable per `from_raw`.
            unsafe { std::ptr::write_volatile(slot, value) };
            Ok(())
        }
    }
}

impl fmt::Debug for PointerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerTable")
            .field("section", &self.section)
            .field("base", &self.base)
            .field("len", &self.len)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// A load command as found in the image, with its raw bytes.
#[derive(Clone, Copy, Debug)]
pub struct LoadCommand<'a> {
    pub cmd: u32,
    /// Offset from the start of the load command area.
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// A segment and its sections, decoded from an `LC_SEGMENT_64`.
#[derive(Clone, Debug)]
pub struct Segment {
    pub name: String,
    pub command: segment_command_64,
    pub sections: Vec<section_64>,
}

impl Segment {
    pub fn is_data(&self) -> bool {
        self.name.starts_with(SEG_DATA_PREFIX)
    }

    /// Whether the loader leaves this segment read-only after fixups.
    pub fn read_only_at_runtime(&self) -> bool {
        self.name == SEG_DATA_CONST
            || self.command.flags & SG_READ_ONLY != 0
            || self.command.initprot & VM_PROT_WRITE == 0
    }
}

/// A 64-bit Mach-O image mapped in this process.
pub struct MachImage {
    header: NonNull<u8>,
    slide: isize,
    name: String,
    commands: &'static [u8],
    ncmds: u32,
}

// SAFETY: the image memory is owned by the loader and never unmapped while
// we hold a handle; we only read through it.
unsafe impl Send for MachImage {}
unsafe impl Sync for MachImage {}

impl MachImage {
    /// Wrap the mapped image whose header starts at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a mapped Mach-O header followed by its load
    /// commands, and the mapping must outlive the returned value. `slide` is
    /// the difference between where the image was mapped and the addresses
    /// recorded in its load commands.
    pub unsafe fn from_raw(
        header: *const u8,
        slide: isize,
        name: impl Into<String>,
    ) -> Result<Self, ImageError> {
        let header = NonNull::new(header as *mut u8).ok_or(ImageError::BadMagic(0))?;
        // SAFETY: the caller guarantees a mapped header.
        let mh = unsafe { std::ptr::read_unaligned(header.as_ptr() as *const mach_header_64) };
        if mh.magic != MH_MAGIC_64 {
            return Err(ImageError::BadMagic(mh.magic));
        }
        // SAFETY: the load command area directly follows the header.
        let commands = unsafe {
            std::slice::from_raw_parts(
                header.as_ptr().add(SIZEOF_MACH_HEADER_64),
                mh.sizeofcmds as usize,
            )
        };
        Ok(Self {
            header,
            slide,
            name: name.into(),
            commands,
            ncmds: mh.ncmds,
        })
    }

    pub fn header_addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    pub fn slide(&self) -> isize {
        self.slide
    }

    pub fn header(&self) -> mach_header_64 {
        // SAFETY: validated in `from_raw`.
        unsafe { std::ptr::read_unaligned(self.header.as_ptr() as *const mach_header_64) }
    }

    /// Iterate the load commands, stopping at the first malformed one.
    pub fn load_commands(&self) -> impl Iterator<Item = Result<LoadCommand<'_>, ImageError>> + '_ {
        let mut offset = 0usize;
        let mut remaining = self.ncmds;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let Some(lc) = read::<load_command>(self.commands, offset) else {
                remaining = 0;
                return Some(Err(ImageError::Truncated(offset)));
            };
            let size = lc.cmdsize as usize;
            let end = offset.checked_add(size);
            if size < std::mem::size_of::<load_command>() || end.is_none_or(|end| end > self.commands.len()) {
                remaining = 0;
                return Some(Err(ImageError::Truncated(offset)));
            }
            let command = LoadCommand {
                cmd: lc.cmd,
                offset,
                bytes: &self.commands[offset..offset + size],
            };
            offset += size;
            Some(Ok(command))
        })
    }

    /// Decode every `LC_SEGMENT_64`, skipping malformed ones.
    pub fn segments(&self) -> Vec<Segment> {
        self.load_commands()
            .map_while(Result::ok)
            .filter(|lc| lc.cmd == LC_SEGMENT_64)
            .filter_map(|lc| decode_segment(lc.bytes))
            .collect()
    }
}

impl Image for MachImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn pointer_tables(&self) -> Vec<PointerTable> {
        let mut tables = Vec::new();
        for segment in self.segments().iter().filter(|s| s.is_data()) {
            let read_only = segment.read_only_at_runtime();
            for section in &segment.sections {
                let kind = section.flags & SECTION_TYPE;
                if kind != S_LAZY_SYMBOL_POINTERS && kind != S_NON_LAZY_SYMBOL_POINTERS {
                    continue;
                }
                let addr = (section.addr as usize).wrapping_add_signed(self.slide);
                let len = section.size as usize / std::mem::size_of::<usize>();
                let name = fixed_name(&section.sectname);
                trace!(
                    "{}: {},{} at 0x{:x} ({} slots)",
                    self.name, segment.name, name, addr, len
                );
                // SAFETY: the loader mapped the section at its slid address.
                if let Some(table) = unsafe { PointerTable::from_raw(name, addr as *mut usize, len, read_only) } {
                    tables.push(table);
                }
            }
        }
        tables
    }
}

impl fmt::Debug for MachImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachImage")
            .field("name", &self.name)
            .field("header", &self.header)
            .field("slide", &self.slide)
            .finish()
    }
}

fn decode_segment(bytes: &[u8]) -> Option<Segment> {
    let command = read::<segment_command_64>(bytes, 0)?;
    let sections = (0..command.nsects as usize)
        .map_while(|i| {
            read::<section_64>(
                bytes,
                std::mem::size_of::<segment_command_64>() + i * std::mem::size_of::<section_64>(),
            )
        })
        .collect();
    Some(Segment {
        name: fixed_name(&command.segname),
        command,
        sections,
    })
}

/// Read a `T` at `offset` if it fits inside `bytes`.
pub(crate) fn read<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    // SAFETY: bounds checked above; `T` is a plain repr(C) struct.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    //! Synthetic images laid out in anonymous mappings.

    use super::*;

    pub const PAGE_GOT: usize = 1;
    pub const PAGE_LAZY: usize = 2;
    pub const PAGE_DATA: usize = 3;
    const PAGES: usize = 4;

    /// A fake image: page 0 holds the header and load commands, page 1 a
    /// `__DATA_CONST,__got` table, page 2 a `__DATA,__la_symbol_ptr` table,
    /// page 3 a plain `__DATA,__data` section. A `__TEXT` segment also
    /// declares a pointer-typed section that must be ignored.
    pub struct SyntheticImage {
        base: *mut u8,
        len: usize,
        pub slots: usize,
    }

    unsafe impl Send for SyntheticImage {}
    unsafe impl Sync for SyntheticImage {}

    impl SyntheticImage {
        pub fn new(slots: usize) -> Self {
            let page = crate::sys::page_size();
            assert!(slots * 8 <= page);
            let len = page * PAGES;
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(base, libc::MAP_FAILED);
            let image = Self {
                base: base as *mut u8,
                len,
                slots,
            };
            image.write_commands(page);
            image
        }

        fn write_commands(&self, page: usize) {
            let sect_size = (self.slots * 8) as u64;
            let segments: [(&str, u32, u32, &[(&str, u64, u32)]); 3] = [
                ("__TEXT", VM_PROT_READ | VM_PROT_EXECUTE, 0, &[("__stubs", 0, S_NON_LAZY_SYMBOL_POINTERS)]),
                (
                    "__DATA_CONST",
                    VM_PROT_READ | VM_PROT_WRITE,
                    SG_READ_ONLY,
                    &[("__got", (PAGE_GOT * page) as u64, S_NON_LAZY_SYMBOL_POINTERS)],
                ),
                (
                    "__DATA",
                    VM_PROT_READ | VM_PROT_WRITE,
                    0,
                    &[
                        ("__la_symbol_ptr", (PAGE_LAZY * page) as u64, S_LAZY_SYMBOL_POINTERS),
                        ("__data", (PAGE_DATA * page) as u64, 0),
                    ],
                ),
            ];

            let mut cmds = Vec::new();
            for (segname, prot, flags, sections) in segments {
                let cmdsize = std::mem::size_of::<segment_command_64>()
                    + sections.len() * std::mem::size_of::<section_64>();
                let command = segment_command_64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: cmdsize as u32,
                    segname: name16(segname),
                    vmaddr: 0,
                    vmsize: self.len as u64,
                    fileoff: 0,
                    filesize: 0,
                    maxprot: prot,
                    initprot: prot,
                    nsects: sections.len() as u32,
                    flags,
                };
                cmds.extend_from_slice(as_bytes(&command));
                for (sectname, addr, kind) in sections {
                    let section = section_64 {
                        sectname: name16(sectname),
                        segname: name16(segname),
                        addr: *addr,
                        size: sect_size,
                        offset: 0,
                        align: 3,
                        reloff: 0,
                        nreloc: 0,
                        flags: *kind,
                        reserved1: 0,
                        reserved2: 0,
                        reserved3: 0,
                    };
                    cmds.extend_from_slice(as_bytes(&section));
                }
            }
            let header = mach_header_64 {
                magic: MH_MAGIC_64,
                cputype: CPU_TYPE_ARM64,
                cpusubtype: 0,
                filetype: MH_EXECUTE,
                ncmds: 3,
                sizeofcmds: cmds.len() as u32,
                flags: 0,
                reserved: 0,
            };
            assert!(SIZEOF_MACH_HEADER_64 + cmds.len() <= page);
            unsafe {
                std::ptr::copy_nonoverlapping(as_bytes(&header).as_ptr(), self.base, SIZEOF_MACH_HEADER_64);
                std::ptr::copy_nonoverlapping(cmds.as_ptr(), self.base.add(SIZEOF_MACH_HEADER_64), cmds.len());
            }
        }

        /// Slot `index` of the table on `page`.
        pub fn slot(&self, page: usize, index: usize) -> usize {
            let offset = page * crate::sys::page_size() + index * 8;
            unsafe { std::ptr::read_volatile(self.base.add(offset) as *const usize) }
        }

        /// Fill a table before the image is handed to the engine.
        pub fn fill(&self, page: usize, values: &[usize]) {
            assert!(values.len() <= self.slots);
            let offset = page * crate::sys::page_size();
            for (i, value) in values.iter().enumerate() {
                unsafe { std::ptr::write_volatile(self.base.add(offset + i * 8) as *mut usize, *value) };
            }
        }

        pub fn image(&self) -> MachImage {
            unsafe { MachImage::from_raw(self.base, self.base as isize, "synthetic") }.unwrap()
        }
    }

    impl Drop for SyntheticImage {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }

    fn name16(name: &str) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        raw
    }

    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn walks_segments_in_order() {
        let synthetic = SyntheticImage::new(4);
        let image = synthetic.image();
        let names: Vec<_> = image.segments().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["__TEXT", "__DATA_CONST", "__DATA"]);
    }

    #[test]
    fn finds_only_data_pointer_sections() {
        let synthetic = SyntheticImage::new(4);
        let tables = synthetic.image().pointer_tables();
        let sections: Vec<_> = tables.iter().map(|t| (t.section().to_string(), t.read_only())).collect();
        assert_eq!(
            sections,
            [("__got".to_string(), true), ("__la_symbol_ptr".to_string(), false)]
        );
        assert!(tables.iter().all(|t| t.len() == 4));
    }

    #[test]
    fn table_reads_are_bounds_checked() {
        let synthetic = SyntheticImage::new(2);
        synthetic.fill(PAGE_LAZY, &[0x1111, 0x2222]);
        let tables = synthetic.image().pointer_tables();
        let lazy = tables.iter().find(|t| t.section() == "__la_symbol_ptr").unwrap();
        assert_eq!(lazy.load(1), Some(0x2222));
        assert_eq!(lazy.load(2), None);
        assert!(lazy.store(2, 0).is_err());
    }

    #[test]
    fn rejects_non_macho_memory() {
        let bytes = [0u8; 64];
        let err = unsafe { MachImage::from_raw(bytes.as_ptr(), 0, "zeros") }.unwrap_err();
        assert!(matches!(err, ImageError::BadMagic(0)));
    }

    #[test]
    fn truncated_load_commands_stop_the_walk() {
        let mut bytes = [0u8; 64];
        let header = mach_header_64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            ncmds: 2,
            sizeofcmds: 16,
            flags: 0,
            reserved: 0,
        };
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut mach_header_64, header);
            // One command claiming 64 bytes in a 16-byte area.
            std::ptr::write_unaligned(
                bytes.as_mut_ptr().add(32) as *mut load_command,
                load_command { cmd: LC_SEGMENT_64, cmdsize: 64 },
            );
        }
        let image = unsafe { MachImage::from_raw(bytes.as_ptr(), 0, "short") }.unwrap();
        let commands: Vec<_> = image.load_commands().collect();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Err(ImageError::Truncated(0))));
        assert!(image.pointer_tables().is_empty());
    }
}

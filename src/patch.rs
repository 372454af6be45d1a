//! Binary format patcher.
//!
//! Turns an on-disk Mach-O executable into something the dynamic loader will
//! accept as an in-process module: the file type becomes `MH_BUNDLE`, the
//! now-invalid code signature is stripped, and for processes without the
//! debugged flag the `__PAGEZERO` segment is shrunk as well.
//!
//! Every operation reads the file, applies all of its edits to a staged copy
//! and only then replaces the file. An operation that fails leaves the file
//! exactly as it was.

use crate::macho::*;
use crate::mmap::MappedFile;
use std::fmt;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// `__PAGEZERO` placement for JIT-less loading.
pub const JITLESS_PAGEZERO_VMADDR: u64 = 0xFFFF_C000;
pub const JITLESS_PAGEZERO_VMSIZE: u64 = 0x4000;

/// `__LINKEDIT` is re-rounded to this after the signature is cut off.
const SEGMENT_ALIGN: u64 = 0x4000;

/// A fat header claiming more slices than this is something else that
/// shares the magic (Java class files).
const MAX_FAT_ARCHS: u32 = 30;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("not a Mach-O file")]
    NotMachO,

    #[error("truncated Mach-O structure at offset {0:#x}")]
    Truncated(usize),

    #[error("unsupported Mach-O layout: {0}")]
    Unsupported(&'static str),

    #[error("required segment {0} not found")]
    MissingSegment(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, PatchError>;

/// Whether an operation changed the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Unchanged,
}

/// Structural edits applied before the signature is stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareMode {
    /// Bundle conversion only; loading relies on the loader bypass.
    Jit,
    /// Bundle conversion plus the `__PAGEZERO` resize.
    JitLess,
}

/// One architecture slice as seen by [`inspect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceInfo {
    pub offset: usize,
    pub size: usize,
    pub cputype: u32,
    pub filetype: u32,
    pub is_64: bool,
    /// `(dataoff, datasize)` of the code signature, relative to the slice.
    pub signature: Option<(u32, u32)>,
}

impl SliceInfo {
    pub fn is_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryInfo {
    pub fat: bool,
    pub slices: Vec<SliceInfo>,
}

impl BinaryInfo {
    pub fn is_executable(&self) -> bool {
        self.slices.iter().any(SliceInfo::is_executable)
    }

    pub fn is_signed(&self) -> bool {
        self.slices.iter().any(|slice| slice.signature.is_some())
    }
}

impl fmt::Display for BinaryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} Mach-O, {} slice(s)",
            if self.fat { "fat" } else { "thin" },
            self.slices.len()
        )?;
        for slice in &self.slices {
            write!(
                f,
                "  {:<8} offset {:#x} size {:#x} {}",
                cputype_name(slice.cputype),
                slice.offset,
                slice.size,
                filetype_name(slice.filetype)
            )?;
            match slice.signature {
                Some((dataoff, datasize)) => {
                    writeln!(f, " signature at {dataoff:#x} ({datasize} bytes)")?
                }
                None => writeln!(f, " unsigned")?,
            }
        }
        Ok(())
    }
}

/// Describe the slices of the binary at `path`.
pub fn inspect(path: impl AsRef<Path>) -> Result<BinaryInfo> {
    let file = MappedFile::open(path)?;
    let buf = file.data();
    let layout = Layout::parse(buf)?;
    let slices = layout
        .slices
        .iter()
        .map(|slice| {
            Ok(SliceInfo {
                offset: slice.offset,
                size: slice.size,
                cputype: slice.cputype,
                filetype: slice.filetype,
                is_64: slice.is_64,
                signature: slice.signature(buf)?.map(|sig| (sig.dataoff, sig.datasize)),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(BinaryInfo {
        fat: layout.fat,
        slices,
    })
}

/// Whether any slice of the binary at `path` is an executable.
pub fn is_executable(path: impl AsRef<Path>) -> Result<bool> {
    Ok(inspect(path)?.is_executable())
}

/// Rewrite every executable slice to `MH_BUNDLE`. Other file types are left
/// alone and reported as [`PatchOutcome::Unchanged`].
pub fn convert_to_bundle(path: impl AsRef<Path>) -> Result<PatchOutcome> {
    edit(path.as_ref(), |buf| {
        let layout = Layout::parse(buf)?;
        convert_slices(buf, &layout)
    })
}

/// Strip the code signature load command and blob from every slice.
pub fn remove_code_signature(path: impl AsRef<Path>) -> Result<PatchOutcome> {
    edit(path.as_ref(), strip_signatures)
}

/// Bundle conversion plus the `__PAGEZERO` resize, for processes that cannot
/// map unsigned code.
pub fn patch_for_jitless(path: impl AsRef<Path>) -> Result<PatchOutcome> {
    edit(path.as_ref(), |buf| {
        let layout = Layout::parse(buf)?;
        let resized = resize_pagezero(buf, &layout)?;
        let converted = convert_slices(buf, &layout)?;
        Ok(resized || converted)
    })
}

/// Prepare a guest binary for in-process loading: the structural edits of
/// `mode`, then signature removal, committed together.
pub fn prepare_guest_binary(path: impl AsRef<Path>, mode: PrepareMode) -> Result<PatchOutcome> {
    let path = path.as_ref();
    let outcome = edit(path, |buf| {
        let layout = Layout::parse(buf)?;
        let mut changed = false;
        if mode == PrepareMode::JitLess {
            changed |= resize_pagezero(buf, &layout)?;
        }
        changed |= convert_slices(buf, &layout)?;
        // Signature removal is always last: any edit above invalidates it.
        changed |= strip_signatures(buf)?;
        Ok(changed)
    })?;
    info!("prepared {} ({mode:?}): {outcome:?}", path.display());
    Ok(outcome)
}

/// Stage `f`'s edits on a copy of the file and commit them if it reports a
/// change.
fn edit(path: &Path, f: impl FnOnce(&mut Vec<u8>) -> Result<bool>) -> Result<PatchOutcome> {
    let mut staged = MappedFile::open(path)?.data().to_vec();
    if !f(&mut staged)? {
        debug!("{}: nothing to change", path.display());
        return Ok(PatchOutcome::Unchanged);
    }
    commit(path, &staged)?;
    Ok(PatchOutcome::Applied)
}

/// Replace `path` with `contents`, keeping its permissions.
fn commit(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let permissions = std::fs::metadata(path)?.permissions();
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    staged.as_file().set_permissions(permissions)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| err.error)?;
    debug!("{}: committed {} bytes", path.display(), contents.len());
    Ok(())
}

fn convert_slices(buf: &mut [u8], layout: &Layout) -> Result<bool> {
    let mut changed = false;
    for slice in layout.slices.iter().filter(|slice| slice.filetype == MH_EXECUTE) {
        slice.endian.put_u32(buf, slice.offset + 12, MH_BUNDLE)?;
        debug!("slice at {:#x}: MH_EXECUTE -> MH_BUNDLE", slice.offset);
        changed = true;
    }
    Ok(changed)
}

fn resize_pagezero(buf: &mut [u8], layout: &Layout) -> Result<bool> {
    let mut changed = false;
    for slice in layout.slices.iter().filter(|slice| slice.filetype == MH_EXECUTE) {
        let segment = slice
            .segment(buf, SEG_PAGEZERO)?
            .ok_or(PatchError::MissingSegment(SEG_PAGEZERO))?;
        slice.put_word(buf, segment + slice.vmaddr_field(), JITLESS_PAGEZERO_VMADDR)?;
        slice.put_word(buf, segment + slice.vmsize_field(), JITLESS_PAGEZERO_VMSIZE)?;
        debug!("slice at {:#x}: __PAGEZERO resized", slice.offset);
        changed = true;
    }
    Ok(changed)
}

fn strip_signatures(buf: &mut Vec<u8>) -> Result<bool> {
    let layout = Layout::parse(buf)?;
    let mut changed = false;
    // Back to front, so truncating a thin file never moves an unvisited slice.
    for slice in layout.slices.iter().rev() {
        let Some(signature) = slice.signature(buf)? else {
            continue;
        };
        strip_signature(buf, slice, &signature)?;
        changed = true;
    }
    Ok(changed)
}

fn strip_signature(buf: &mut Vec<u8>, slice: &Slice, signature: &Signature) -> Result<()> {
    let base = slice.offset;
    let command = base + signature.command.offset;
    let command_size = signature.command.size;
    let commands_end = base + slice.header_size() + slice.sizeofcmds as usize;

    let blob_start = base + signature.dataoff as usize;
    let blob_end = blob_start + signature.datasize as usize;
    if blob_end > base + slice.size {
        return Err(PatchError::Truncated(command));
    }

    let linkedit = slice.segment(buf, SEG_LINKEDIT)?;

    buf.copy_within(command + command_size..commands_end, command);
    buf[commands_end - command_size..commands_end].fill(0);
    slice.endian.put_u32(buf, base + 16, slice.ncmds - 1)?;
    slice
        .endian
        .put_u32(buf, base + 20, slice.sizeofcmds - command_size as u32)?;

    if let Some(mut segment) = linkedit {
        if segment > command {
            segment -= command_size;
        }
        let fileoff = slice.word(buf, segment + slice.fileoff_field())?;
        let dataoff = signature.dataoff as u64;
        if dataoff >= fileoff {
            let filesize = dataoff - fileoff;
            slice.put_word(buf, segment + slice.filesize_field(), filesize)?;
            slice.put_word(
                buf,
                segment + slice.vmsize_field(),
                filesize.div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN,
            )?;
        }
    }

    buf[blob_start..blob_end].fill(0);
    let blob_is_trailing = signature.dataoff as usize + signature.datasize as usize == slice.size;
    match slice.arch_entry {
        None if blob_end == buf.len() => buf.truncate(blob_start),
        None => {}
        Some(entry) if blob_is_trailing => {
            entry.put_size(buf, signature.dataoff as u64)?;
        }
        Some(_) => {}
    }
    debug!(
        "slice at {base:#x}: removed {}-byte signature at {:#x}",
        signature.datasize, signature.dataoff
    );
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn bytes<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
        offset
            .checked_add(N)
            .and_then(|end| buf.get(offset..end))
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(PatchError::Truncated(offset))
    }

    fn put<const N: usize>(buf: &mut [u8], offset: usize, bytes: [u8; N]) -> Result<()> {
        offset
            .checked_add(N)
            .and_then(|end| buf.get_mut(offset..end))
            .ok_or(PatchError::Truncated(offset))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn u32(self, buf: &[u8], offset: usize) -> Result<u32> {
        let bytes = Self::bytes(buf, offset)?;
        Ok(match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    fn u64(self, buf: &[u8], offset: usize) -> Result<u64> {
        let bytes = Self::bytes(buf, offset)?;
        Ok(match self {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    fn put_u32(self, buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
        match self {
            Endian::Little => Self::put(buf, offset, value.to_le_bytes()),
            Endian::Big => Self::put(buf, offset, value.to_be_bytes()),
        }
    }

    fn put_u64(self, buf: &mut [u8], offset: usize, value: u64) -> Result<()> {
        match self {
            Endian::Little => Self::put(buf, offset, value.to_le_bytes()),
            Endian::Big => Self::put(buf, offset, value.to_be_bytes()),
        }
    }
}

/// Position of a slice's `fat_arch` entry in the fat header.
#[derive(Clone, Copy, Debug)]
struct ArchEntry {
    offset: usize,
    is_64: bool,
}

impl ArchEntry {
    fn slice_offset(&self, buf: &[u8]) -> Result<u64> {
        if self.is_64 {
            Endian::Big.u64(buf, self.offset + 8)
        } else {
            Endian::Big.u32(buf, self.offset + 8).map(u64::from)
        }
    }

    fn slice_size(&self, buf: &[u8]) -> Result<u64> {
        if self.is_64 {
            Endian::Big.u64(buf, self.offset + 16)
        } else {
            Endian::Big.u32(buf, self.offset + 12).map(u64::from)
        }
    }

    fn put_size(&self, buf: &mut [u8], size: u64) -> Result<()> {
        if self.is_64 {
            Endian::Big.put_u64(buf, self.offset + 16, size)
        } else {
            Endian::Big.put_u32(buf, self.offset + 12, size as u32)
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Command {
    cmd: u32,
    /// Relative to the start of the slice.
    offset: usize,
    size: usize,
}

#[derive(Clone, Copy, Debug)]
struct Signature {
    command: Command,
    dataoff: u32,
    datasize: u32,
}

#[derive(Clone, Debug)]
struct Slice {
    offset: usize,
    size: usize,
    endian: Endian,
    is_64: bool,
    cputype: u32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    commands: Vec<Command>,
    arch_entry: Option<ArchEntry>,
}

impl Slice {
    fn parse(buf: &[u8], offset: usize, size: usize, arch_entry: Option<ArchEntry>) -> Result<Self> {
        let (is_64, endian) = match Endian::Little.u32(buf, offset)? {
            MH_MAGIC_64 => (true, Endian::Little),
            MH_CIGAM_64 => (true, Endian::Big),
            MH_MAGIC => (false, Endian::Little),
            MH_CIGAM => (false, Endian::Big),
            _ => return Err(PatchError::NotMachO),
        };
        let mut slice = Self {
            offset,
            size,
            endian,
            is_64,
            cputype: endian.u32(buf, offset + 4)?,
            filetype: endian.u32(buf, offset + 12)?,
            ncmds: endian.u32(buf, offset + 16)?,
            sizeofcmds: endian.u32(buf, offset + 20)?,
            commands: Vec::new(),
            arch_entry,
        };

        let start = slice.header_size();
        let end = start + slice.sizeofcmds as usize;
        if end > size || offset + end > buf.len() {
            return Err(PatchError::Truncated(offset + start));
        }
        let mut at = start;
        for _ in 0..slice.ncmds {
            let cmd = endian.u32(buf, offset + at)?;
            let cmdsize = endian.u32(buf, offset + at + 4)? as usize;
            if cmdsize < 8 || at + cmdsize > end {
                return Err(PatchError::Truncated(offset + at));
            }
            slice.commands.push(Command {
                cmd,
                offset: at,
                size: cmdsize,
            });
            at += cmdsize;
        }
        Ok(slice)
    }

    fn header_size(&self) -> usize {
        if self.is_64 {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER
        }
    }

    fn signature(&self, buf: &[u8]) -> Result<Option<Signature>> {
        let mut signatures = self.commands.iter().filter(|c| c.cmd == LC_CODE_SIGNATURE);
        let Some(command) = signatures.next() else {
            return Ok(None);
        };
        if signatures.next().is_some() {
            return Err(PatchError::Unsupported("more than one LC_CODE_SIGNATURE"));
        }
        if command.size < std::mem::size_of::<linkedit_data_command>() {
            return Err(PatchError::Truncated(self.offset + command.offset));
        }
        let at = self.offset + command.offset;
        Ok(Some(Signature {
            command: *command,
            dataoff: self.endian.u32(buf, at + 8)?,
            datasize: self.endian.u32(buf, at + 12)?,
        }))
    }

    /// Absolute offset of the segment command named `name`.
    fn segment(&self, buf: &[u8], name: &str) -> Result<Option<usize>> {
        let kind = if self.is_64 { LC_SEGMENT_64 } else { LC_SEGMENT };
        for command in self.commands.iter().filter(|c| c.cmd == kind) {
            let at = self.offset + command.offset;
            let raw: [u8; 16] = Endian::bytes(buf, at + 8)?;
            if fixed_name(&raw) == name {
                return Ok(Some(at));
            }
        }
        Ok(None)
    }

    fn vmaddr_field(&self) -> usize {
        24
    }

    fn vmsize_field(&self) -> usize {
        if self.is_64 { 32 } else { 28 }
    }

    fn fileoff_field(&self) -> usize {
        if self.is_64 { 40 } else { 32 }
    }

    fn filesize_field(&self) -> usize {
        if self.is_64 { 48 } else { 36 }
    }

    /// Read an address-sized segment field.
    fn word(&self, buf: &[u8], offset: usize) -> Result<u64> {
        if self.is_64 {
            self.endian.u64(buf, offset)
        } else {
            self.endian.u32(buf, offset).map(u64::from)
        }
    }

    fn put_word(&self, buf: &mut [u8], offset: usize, value: u64) -> Result<()> {
        if self.is_64 {
            self.endian.put_u64(buf, offset, value)
        } else {
            self.endian.put_u32(buf, offset, value as u32)
        }
    }
}

#[derive(Debug)]
struct Layout {
    fat: bool,
    slices: Vec<Slice>,
}

impl Layout {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(PatchError::NotMachO);
        }
        let magic = Endian::Big.u32(buf, 0)?;
        if magic != FAT_MAGIC && magic != FAT_MAGIC_64 {
            return Ok(Self {
                fat: false,
                slices: vec![Slice::parse(buf, 0, buf.len(), None)?],
            });
        }

        let is_64 = magic == FAT_MAGIC_64;
        let nfat_arch = Endian::Big.u32(buf, 4)?;
        if nfat_arch == 0 || nfat_arch > MAX_FAT_ARCHS {
            return Err(PatchError::NotMachO);
        }
        let entry_size = if is_64 {
            SIZEOF_FAT_ARCH_64
        } else {
            SIZEOF_FAT_ARCH
        };
        let mut slices = Vec::with_capacity(nfat_arch as usize);
        for index in 0..nfat_arch as usize {
            let entry = ArchEntry {
                offset: SIZEOF_FAT_HEADER + index * entry_size,
                is_64,
            };
            let offset = usize::try_from(entry.slice_offset(buf)?)
                .map_err(|_| PatchError::Truncated(entry.offset))?;
            let size = usize::try_from(entry.slice_size(buf)?)
                .map_err(|_| PatchError::Truncated(entry.offset))?;
            if offset.checked_add(size).is_none_or(|end| end > buf.len()) {
                return Err(PatchError::Truncated(entry.offset));
            }
            slices.push(Slice::parse(buf, offset, size, Some(entry))?);
        }
        Ok(Self {
            fat: true,
            slices,
        })
    }
}

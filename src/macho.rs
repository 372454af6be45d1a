//! Mach-O binary format structures and constants.
//!
//! This module contains the C layout structures and constants used for
//! walking Mach-O images, both mapped images in memory and binaries on disk.
//! These are shared between the image walker and the binary format patcher.

#![allow(non_camel_case_types)]

// Mach-O magic numbers (as read in host byte order from a little-endian file)
pub const MH_MAGIC: u32 = 0xfeedface; // 32-bit Mach-O
pub const MH_MAGIC_64: u32 = 0xfeedfacf; // 64-bit Mach-O
pub const MH_CIGAM: u32 = 0xcefaedfe; // 32-bit, byte-swapped
pub const MH_CIGAM_64: u32 = 0xcffaedfe; // 64-bit, byte-swapped

// Fat headers are always big-endian on disk
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;

// File types
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

// Load command types
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

// Section types (low byte of section flags)
pub const SECTION_TYPE: u32 = 0x000000ff;
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;

// Segment flags
pub const SG_READ_ONLY: u32 = 0x10;

// VM protections
pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;
pub const VM_PROT_COPY: u32 = 0x10;

// CPU types
pub const CPU_TYPE_X86_64: u32 = 0x01000007;
pub const CPU_TYPE_ARM64: u32 = 0x0100000c;

pub const SEG_PAGEZERO: &str = "__PAGEZERO";
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
pub const SEG_DATA_PREFIX: &str = "__DATA";
pub const SEG_DATA_CONST: &str = "__DATA_CONST";

pub const SIZEOF_MACH_HEADER: usize = 28;
pub const SIZEOF_MACH_HEADER_64: usize = 32;
pub const SIZEOF_FAT_HEADER: usize = 8;
pub const SIZEOF_FAT_ARCH: usize = 20;
pub const SIZEOF_FAT_ARCH_64: usize = 32;

/// Mach-O 64-bit header
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct mach_header_64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// Generic load command header
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct load_command {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// 64-bit segment load command
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct segment_command_64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

/// 64-bit section within a segment
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct section_64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

/// LinkEdit data command (LC_CODE_SIGNATURE, LC_FUNCTION_STARTS, etc.)
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct linkedit_data_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

/// Decode a fixed-size, NUL-padded Mach-O name.
pub fn fixed_name(raw: &[u8; 16]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .to_string()
}

pub fn filetype_name(filetype: u32) -> &'static str {
    match filetype {
        0x1 => "MH_OBJECT",
        MH_EXECUTE => "MH_EXECUTE",
        MH_DYLIB => "MH_DYLIB",
        0x7 => "MH_DYLINKER",
        MH_BUNDLE => "MH_BUNDLE",
        _ => "MH_UNKNOWN",
    }
}

pub fn cputype_name(cputype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_X86_64 => "x86_64",
        0x7 => "i386",
        0xc => "arm",
        _ => "unknown",
    }
}

//! Linux host support.
//!
//! Linux has no Mach-O images; the symbol-pointer slots of an ELF object are
//! its GOT entries, found through the object's `JUMP_SLOT` and `GLOB_DAT`
//! relocations.

pub mod kernel;
pub mod ld_linux;

pub use kernel::is_debugged;
pub use ld_linux::{loaded_images, main_image};

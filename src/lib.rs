//! Lodge - a process sandbox for guest binaries.
//!
//! Lodge runs untrusted guest executables inside worker processes and keeps
//! a table of the virtual processes it started. To make a guest loadable it
//! rewrites the guest binary on disk and the symbol pointers of the images
//! already loaded in memory.
//!
//! # Modules
//!
//! - [`hook`] - Symbol pointer rewriting across loaded images
//! - [`bypass`] - Loader validation bypass for loading unsigned guests
//! - [`guest`] - Redirection of guest process creation to the kernel
//! - [`patch`] - Guest binary conversion and signature removal
//! - [`kernel`] - Virtual process table, workers and output channel
//! - [`runner`] - Guest execution inside a worker
//! - [`sys`] - Platform-specific system interfaces (Linux, macOS)
//!
//! # Error Handling
//!
//! Each component has its own error type; [`Error`] consolidates them for
//! callers that drive several components at once.

pub mod bypass;
pub mod guest;
pub mod hook;
pub mod image;
pub mod install;
pub mod kernel;
pub mod libc;
pub mod macho;
pub mod mmap;
pub mod patch;
pub mod runner;
pub mod symbols;
pub mod sys;

/// Consolidated error type for all Lodge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel error: {0}")]
    Kernel(#[from] kernel::KernelError),

    #[error("hook error: {0}")]
    Hook(#[from] hook::HookError),

    #[error("binary patch error: {0}")]
    Patch(#[from] patch::PatchError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("runner error: {0}")]
    Runner(#[from] runner::RunnerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use hook::{HookError, HookReport, HookResult, HookScope, PatchEngine};
pub use install::Install;
pub use kernel::{Kernel, KernelBuilder, KernelConfig, KernelError, KernelEvent, Pid, Process};
pub use mmap::MappedFile;

/// Pid of the process hosting this library.
pub fn host_pid() -> kernel::Pid {
    std::process::id() as kernel::Pid
}

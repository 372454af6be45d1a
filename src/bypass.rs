//! Loader validation bypass.
//!
//! Replaces the loader's file-control and mapping entry points so that, in a
//! process whose code-signing flags mark it as debugged, images with invalid
//! or stripped signatures still load. Without that flag the kernel enforces
//! signatures regardless and the replacements change nothing; that is the
//! normal state of an undebugged process, not an error.
//!
//! The bypass also owns the path reported as the running executable, so that
//! a guest loaded in-process resolves `@executable_path` against itself.

use crate::hook::PatchEngine;
use crate::install::{Install, InstallOnce};
use crate::symbols::LOADER_HOOKS;
use parking_lot::RwLock;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::info;

static BYPASS: LoaderBypass = LoaderBypass::new();

static GUEST_EXECUTABLE_PATH: RwLock<Option<CString>> = RwLock::new(None);

#[derive(Debug, Default)]
pub struct LoaderBypass {
    once: InstallOnce,
}

impl LoaderBypass {
    pub const fn new() -> Self {
        Self {
            once: InstallOnce::new(),
        }
    }

    pub fn installed(&self) -> bool {
        self.once.installed()
    }

    /// Redirect the loader entry points through `engine`, once.
    pub fn install(&self, engine: &PatchEngine) -> Install {
        self.once.install(|| {
            if !is_jit_enabled() {
                info!("process is not marked debugged; loader bypass is inert");
            }
            let report = engine.install(&LOADER_HOOKS);
            info!(
                "loader bypass installed ({} slot(s), {} protection failures)",
                report.replaced, report.protection_failures
            );
        })
    }
}

/// Install the process-wide loader bypass. Later calls do nothing.
pub fn init_bypass() -> Install {
    BYPASS.install(&PatchEngine::loader())
}

pub fn bypass_installed() -> bool {
    BYPASS.installed()
}

/// Whether the process carries the debugged code-signing flag that lets it
/// map unsigned executable pages.
pub fn is_jit_enabled() -> bool {
    crate::sys::is_debugged()
}

/// Report `path` as the current executable from now on.
pub fn set_guest_executable_path(path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
    })?;
    *GUEST_EXECUTABLE_PATH.write() = Some(path);
    Ok(())
}

pub fn clear_guest_executable_path() {
    *GUEST_EXECUTABLE_PATH.write() = None;
}

pub fn guest_executable_path() -> Option<PathBuf> {
    with_guest_executable_path(|path| {
        path.map(|path| PathBuf::from(std::ffi::OsStr::from_bytes(path.to_bytes())))
    })
}

pub(crate) fn with_guest_executable_path<R>(f: impl FnOnce(Option<&CStr>) -> R) -> R {
    f(GUEST_EXECUTABLE_PATH.read().as_deref())
}

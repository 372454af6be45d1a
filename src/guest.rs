//! Guest syscall interceptor.
//!
//! Guest code loaded into the worker calls `posix_spawn`, `execve` and
//! `waitpid` as if it owned the OS. Once [`install_hooks`] has run, those
//! calls reach the replacements in [`crate::libc::spawn`], which hand them to
//! the attached [`GuestSpawner`] (normally the kernel).
//!
//! A thread that needs the real primitives, for example the runner starting
//! the guest itself, holds a [`SuppressGuard`] for the duration of the call.

use crate::hook::PatchEngine;
use crate::install::{Install, InstallOnce};
use crate::kernel::{KernelError, Pid, SpawnOptions};
use crate::symbols::GUEST_HOOKS;
use parking_lot::RwLock;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Where redirected process-creation calls go.
pub trait GuestSpawner: Send + Sync {
    /// Start a virtual process and return its pid.
    fn spawn(&self, options: SpawnOptions) -> Result<Pid, KernelError>;

    /// Whether `pid` names a virtual process of this spawner.
    fn owns(&self, pid: Pid) -> bool;

    /// Exit code of `pid`, waiting for it when `block` is set. `Ok(None)`
    /// means still running.
    fn wait(&self, pid: Pid, block: bool) -> Result<Option<i32>, KernelError>;
}

static GUEST: GuestHooks = GuestHooks::new();

static SPAWNER: RwLock<Option<Arc<dyn GuestSpawner>>> = RwLock::new(None);

static REDIRECTS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static SUPPRESSED: Cell<u32> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
pub struct GuestHooks {
    once: InstallOnce,
}

impl GuestHooks {
    pub const fn new() -> Self {
        Self {
            once: InstallOnce::new(),
        }
    }

    pub fn installed(&self) -> bool {
        self.once.installed()
    }

    pub fn install(&self, engine: &PatchEngine) -> Install {
        let outcome = self.once.install(|| {
            let report = engine.install(&GUEST_HOOKS);
            info!(
                "guest hooks installed ({} slot(s), {} protection failures)",
                report.replaced, report.protection_failures
            );
        });
        if outcome == Install::AlreadyInstalled {
            info!("guest hooks already installed");
        }
        outcome
    }
}

/// Install the process-creation hooks across every loaded image, once.
pub fn install_hooks() -> Install {
    GUEST.install(&PatchEngine::loader())
}

pub fn hooks_installed() -> bool {
    GUEST.installed()
}

/// Route redirected calls to `spawner`.
pub fn set_spawner(spawner: Arc<dyn GuestSpawner>) {
    *SPAWNER.write() = Some(spawner);
}

pub fn clear_spawner() {
    *SPAWNER.write() = None;
}

/// The spawner redirected calls on this thread should use, if any.
pub(crate) fn active_spawner() -> Option<Arc<dyn GuestSpawner>> {
    if hooks_suppressed() {
        return None;
    }
    SPAWNER.read().clone()
}

pub(crate) fn note_redirect() {
    REDIRECTS.fetch_add(1, Ordering::Relaxed);
}

/// Number of process-creation calls redirected so far.
pub fn redirect_count() -> u64 {
    REDIRECTS.load(Ordering::Relaxed)
}

/// Whether interception is suppressed on the calling thread.
pub fn hooks_suppressed() -> bool {
    SUPPRESSED.with(|count| count.get() > 0)
}

/// Suppresses interception on the current thread while alive.
///
/// Guards nest; interception resumes when the last one drops. The guard is
/// neither `Send` nor `Sync`, so it is always released on the thread that
/// took it.
#[must_use = "interception resumes as soon as the guard is dropped"]
pub struct SuppressGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl SuppressGuard {
    pub fn new() -> Self {
        SUPPRESSED.with(|count| count.set(count.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Default for SuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESSED.with(|count| count.set(count.get().saturating_sub(1)));
    }
}

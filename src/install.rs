//! One-shot installation state shared by the loader bypass and guest hooks.
//!
//! Hooks, once installed, stay installed for the life of the process, so the
//! only transitions are `Uninstalled -> Installing -> Installed`. A failed
//! (panicking) installation rolls back to `Uninstalled`.

use std::sync::atomic::{AtomicU8, Ordering};

const UNINSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;

/// Outcome of [`InstallOnce::install`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Install {
    /// This call performed the installation.
    Installed,
    /// An earlier call already did; nothing was applied.
    AlreadyInstalled,
}

#[derive(Debug)]
pub struct InstallOnce {
    state: AtomicU8,
}

impl InstallOnce {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINSTALLED),
        }
    }

    pub fn installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSTALLED
    }

    /// Run `f` if and only if no other call has run it.
    ///
    /// Concurrent callers wait for the winning call to finish, so a return of
    /// [`Install::AlreadyInstalled`] means the installation is complete.
    pub fn install(&self, f: impl FnOnce()) -> Install {
        match self
            .state
            .compare_exchange(UNINSTALLED, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let rollback = Rollback(&self.state);
                f();
                std::mem::forget(rollback);
                self.state.store(INSTALLED, Ordering::Release);
                Install::Installed
            }
            Err(_) => {
                while self.state.load(Ordering::Acquire) == INSTALLING {
                    std::thread::yield_now();
                }
                if self.installed() {
                    Install::AlreadyInstalled
                } else {
                    // The winner panicked and rolled back; try again.
                    self.install(f)
                }
            }
        }
    }
}

impl Default for InstallOnce {
    fn default() -> Self {
        Self::new()
    }
}

struct Rollback<'a>(&'a AtomicU8);

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        self.0.store(UNINSTALLED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_install_is_a_noop() {
        let once = InstallOnce::new();
        let runs = AtomicUsize::new(0);
        assert!(!once.installed());
        assert_eq!(once.install(|| { runs.fetch_add(1, Ordering::SeqCst); }), Install::Installed);
        assert_eq!(once.install(|| { runs.fetch_add(1, Ordering::SeqCst); }), Install::AlreadyInstalled);
        assert!(once.installed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_installers_run_once() {
        let once = Arc::new(InstallOnce::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let once = once.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    once.install(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        let installed = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|outcome| *outcome == Install::Installed)
            .count();
        assert_eq!(installed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_install_rolls_back() {
        let once = InstallOnce::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            once.install(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!once.installed());
        assert_eq!(once.install(|| {}), Install::Installed);
    }
}

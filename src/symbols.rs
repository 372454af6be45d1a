//! Registry of replacement functions.
//!
//! Functions marked with `#[interpose(..)]` land in one of the distributed
//! slices below. Installing a registry resolves each symbol, records the real
//! address in the entry's [`Original`] slot, and rewrites every symbol-pointer
//! slot that points at it.

use linkme::distributed_slice;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A function pointer wrapper that's Sync.
///
/// Function pointers are safe to share across threads (they're just addresses
/// into read-only code), but Rust doesn't automatically implement Sync for
/// raw pointers.
#[derive(Clone, Copy, Debug)]
pub struct FnPtr(pub *const ());

// SAFETY: Function pointers point to immutable code, so they're safe to share.
unsafe impl Sync for FnPtr {}
unsafe impl Send for FnPtr {}

impl FnPtr {
    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

/// Address of the real implementation behind a replaced symbol.
///
/// Zero until the owning registry is installed.
#[derive(Debug)]
pub struct Original(AtomicUsize);

impl Original {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn set(&self, addr: usize) {
        self.0.store(addr, Ordering::Release);
    }

    pub fn addr(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Reinterpret the recorded address as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the C signature of the
    /// replaced symbol. A type of any other size fails to compile.
    pub unsafe fn get<F: Copy>(&self) -> Option<F> {
        const { assert!(std::mem::size_of::<F>() == std::mem::size_of::<usize>()) };
        self.addr()
            .map(|addr| unsafe { std::mem::transmute_copy::<usize, F>(&addr) })
    }
}

impl Default for Original {
    fn default() -> Self {
        Self::new()
    }
}

/// One replacement: the symbol it stands in for, the replacement itself, and
/// where to record the real implementation.
#[derive(Debug)]
pub struct Interposer {
    pub symbol: &'static str,
    pub replacement: FnPtr,
    pub original: &'static Original,
}

/// Process-creation hooks installed by the guest syscall interceptor.
#[distributed_slice]
pub static GUEST_HOOKS: [Interposer] = [..];

/// Loader entry points replaced by the validation bypass.
#[distributed_slice]
pub static LOADER_HOOKS: [Interposer] = [..];

/// Look up a replacement by symbol name across both registries.
pub fn lookup(symbol_name: &str) -> Option<&'static Interposer> {
    GUEST_HOOKS
        .iter()
        .chain(LOADER_HOOKS.iter())
        .find(|hook| hook.symbol == symbol_name)
}

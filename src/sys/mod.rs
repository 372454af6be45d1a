//! Platform-specific system interfaces.
//!
//! This module provides a unified interface to platform-specific functionality,
//! abstracting over differences between operating systems (Linux, macOS, etc.).
//!
//! The platform-specific implementations are conditionally compiled based on the
//! target OS, and common entry points are re-exported at the module level.

use parking_lot::Mutex;

#[cfg(target_vendor = "apple")]
pub mod darwin;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_vendor = "apple")]
pub use darwin::{is_debugged, loaded_images, main_image};

#[cfg(target_os = "linux")]
pub use linux::{is_debugged, loaded_images, main_image};

#[cfg(target_vendor = "apple")]
use darwin::write_protected as store_protected;

#[cfg(not(target_vendor = "apple"))]
use self::mprotect::write_protected as store_protected;

#[cfg(not(any(target_vendor = "apple", target_os = "linux")))]
pub use self::unsupported::{is_debugged, loaded_images, main_image};

/// Held across each unprotect, store and reprotect sequence; slots sharing a
/// page see one sequence at a time.
static PROTECTION: Mutex<()> = Mutex::new(());

/// Store `value` into a slot on a read-only page, leaving the page read-only.
pub fn write_protected(slot: *mut usize, value: usize) -> std::io::Result<()> {
    let _serialized = PROTECTION.lock();
    store_protected(slot, value)
}

/// Size of a VM page on this host.
pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Set the calling thread's `errno`.
pub fn set_errno(errno: libc::c_int) {
    #[cfg(target_vendor = "apple")]
    unsafe {
        *libc::__error() = errno;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        *libc::__errno_location() = errno;
    }
    #[cfg(not(any(target_vendor = "apple", target_os = "linux", target_os = "android")))]
    let _ = errno;
}

#[cfg(not(target_vendor = "apple"))]
mod mprotect {
    use super::page_size;

    /// Store `value` into a slot on a read-only page, keeping the page
    /// writable only around the store.
    pub fn write_protected(slot: *mut usize, value: usize) -> std::io::Result<()> {
        let page = page_size();
        let start = (slot as usize & !(page - 1)) as *mut libc::c_void;
        if unsafe { libc::mprotect(start, page, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { std::ptr::write_volatile(slot, value) };
        if unsafe { libc::mprotect(start, page, libc::PROT_READ) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(any(target_vendor = "apple", target_os = "linux")))]
mod unsupported {
    use crate::image::Image;

    pub fn loaded_images() -> Vec<Box<dyn Image>> {
        Vec::new()
    }

    pub fn main_image() -> Option<Box<dyn Image>> {
        None
    }

    pub fn is_debugged() -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct ReadOnlyPage(*mut usize);

    unsafe impl Send for ReadOnlyPage {}
    unsafe impl Sync for ReadOnlyPage {}

    impl Drop for ReadOnlyPage {
        fn drop(&mut self) {
            unsafe { libc::munmap(self.0 as *mut libc::c_void, page_size()) };
        }
    }

    fn read_only_page() -> ReadOnlyPage {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size(),
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        ReadOnlyPage(page as *mut usize)
    }

    #[test]
    fn concurrent_stores_to_one_read_only_page() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;
        let page = Arc::new(read_only_page());

        let writers: Vec<_> = (0..THREADS)
            .map(|index| {
                let page = page.clone();
                std::thread::spawn(move || {
                    let slot = unsafe { page.0.add(index) };
                    for round in 0..ROUNDS {
                        write_protected(slot, index * ROUNDS + round).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        for index in 0..THREADS {
            let value = unsafe { std::ptr::read_volatile(page.0.add(index)) };
            assert_eq!(value, index * ROUNDS + ROUNDS - 1);
        }
    }
}

//! Loader entry points replaced by the validation bypass.
//!
//! Each replacement forwards to the real function and only changes the
//! outcome of the calls the loader makes while validating a mapped image.

use macros::interpose;
use std::ffi::{c_char, c_int, c_void};
use tracing::debug;

/// Register a code signature for a range of the file; the kernel writes back
/// the end of the covered range.
pub const F_ADDFILESIGS_RETURN: c_int = 97;
/// Check that a file may be loaded into this process (library validation).
pub const F_CHECK_LV: c_int = 98;

/// End offset reported for a signature registration: the whole file.
const WHOLE_FILE: libc::off_t = 0xFFFF_FFFF;

#[cfg(target_vendor = "apple")]
type FcntlFn = unsafe extern "C" fn(c_int, c_int, *mut c_void) -> c_int;
#[cfg(not(target_vendor = "apple"))]
type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;

type MmapFn =
    unsafe extern "C" fn(*mut c_void, libc::size_t, c_int, c_int, c_int, libc::off_t) -> *mut c_void;

fn real_fcntl(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    match unsafe { ORIG_FCNTL.get::<FcntlFn>() } {
        Some(real) => unsafe { real(fd, cmd, arg) },
        None => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

fn real_mmap() -> MmapFn {
    unsafe { ORIG_MMAP.get::<MmapFn>() }.unwrap_or(libc::mmap)
}

/// File control, with signature registration and library validation always
/// reported as successful.
#[cfg_attr(target_vendor = "apple", interpose(loader, symbol = "__fcntl"))]
#[cfg_attr(not(target_vendor = "apple"), interpose(loader))]
pub fn fcntl(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    let ret = real_fcntl(fd, cmd, arg);
    match cmd {
        F_ADDFILESIGS_RETURN if cfg!(target_vendor = "apple") => {
            if !arg.is_null() {
                // fs_file_start is the first field of fsignatures_t.
                unsafe { *(arg as *mut libc::off_t) = WHOLE_FILE };
            }
            if ret != 0 {
                debug!("fcntl(F_ADDFILESIGS_RETURN) on fd {fd} failed, reporting full coverage");
            }
            0
        }
        F_CHECK_LV if cfg!(target_vendor = "apple") => {
            if ret != 0 {
                debug!("fcntl(F_CHECK_LV) on fd {fd} failed, reporting success");
            }
            0
        }
        _ => ret,
    }
}

/// Map memory; while the bypass is in effect, an executable file mapping the
/// OS refuses is rebuilt from an anonymous mapping filled with the file's
/// bytes.
#[interpose(loader)]
pub fn mmap(
    addr: *mut c_void,
    len: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    map_or_remap(real_mmap(), bypass_active, addr, len, prot, flags, fd, offset)
}

/// The process may map unsigned code and the loader bypass is installed.
fn bypass_active() -> bool {
    crate::bypass::bypass_installed() && crate::bypass::is_jit_enabled()
}

/// Map through `real`, falling back to [`remap_anonymous`] only for refused
/// executable file mappings and only when `bypassing` says so. A refusal
/// that is not rebuilt keeps the errno `real` set.
#[allow(clippy::too_many_arguments)]
fn map_or_remap(
    real: MmapFn,
    bypassing: impl FnOnce() -> bool,
    addr: *mut c_void,
    len: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let mapped = unsafe { real(addr, len, prot, flags, fd, offset) };
    if mapped != libc::MAP_FAILED || fd < 0 || prot & libc::PROT_EXEC == 0 {
        return mapped;
    }
    let refused = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EACCES);
    if !bypassing() {
        crate::sys::set_errno(refused);
        return libc::MAP_FAILED;
    }
    debug!("executable mapping of fd {fd} refused (errno {refused}), rebuilding it");
    unsafe { remap_anonymous(real, addr, len, prot, flags, fd, offset) }
}

/// Build a mapping of `len` bytes at `addr` holding the file contents at
/// `offset`, with protection `prot`.
///
/// # Safety
///
/// Same contract as `mmap`; `real` must be the real `mmap`.
unsafe fn remap_anonymous(
    real: MmapFn,
    addr: *mut c_void,
    len: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let anon_flags = (flags & libc::MAP_FIXED) | libc::MAP_PRIVATE | libc::MAP_ANON;
    let anon = unsafe { real(addr, len, libc::PROT_READ | libc::PROT_WRITE, anon_flags, -1, 0) };
    if anon == libc::MAP_FAILED {
        return libc::MAP_FAILED;
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        unsafe { libc::munmap(anon, len) };
        return libc::MAP_FAILED;
    }
    // Bytes past the end of the file stay zero; touching them through a file
    // mapping would fault.
    let available = (stat.st_size - offset).max(0) as usize;
    let copy_len = len.min(available);
    if copy_len > 0 {
        let source = unsafe { real(std::ptr::null_mut(), copy_len, libc::PROT_READ, libc::MAP_PRIVATE, fd, offset) };
        if source == libc::MAP_FAILED {
            unsafe { libc::munmap(anon, len) };
            return libc::MAP_FAILED;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(source as *const u8, anon as *mut u8, copy_len);
            libc::munmap(source, copy_len);
        }
    }

    if unsafe { libc::mprotect(anon, len, prot) } != 0 {
        unsafe { libc::munmap(anon, len) };
        return libc::MAP_FAILED;
    }
    anon
}

/// Report the guest's path as the running executable when one is set.
#[cfg(target_vendor = "apple")]
#[interpose(loader)]
#[allow(non_snake_case)]
pub fn _NSGetExecutablePath(buf: *mut c_char, bufsize: *mut u32) -> c_int {
    type NsGetExecutablePathFn = unsafe extern "C" fn(*mut c_char, *mut u32) -> c_int;

    let handled = crate::bypass::with_guest_executable_path(|path| {
        let path = path?;
        Some(unsafe { copy_path(path, buf, bufsize) })
    });
    if let Some(ret) = handled {
        return ret;
    }
    match unsafe { ORIG__NSGETEXECUTABLEPATH.get::<NsGetExecutablePathFn>() } {
        Some(real) => unsafe { real(buf, bufsize) },
        None => -1,
    }
}

/// Copy `path` into a caller buffer of `*bufsize` bytes, following the
/// `_NSGetExecutablePath` convention: on a short buffer store the needed size
/// and return -1.
///
/// # Safety
///
/// `buf` must be writable for `*bufsize` bytes and `bufsize` valid.
#[allow(dead_code)]
unsafe fn copy_path(path: &std::ffi::CStr, buf: *mut c_char, bufsize: *mut u32) -> c_int {
    if bufsize.is_null() {
        return -1;
    }
    let bytes = path.to_bytes_with_nul();
    let needed = bytes.len() as u32;
    if buf.is_null() || unsafe { *bufsize } < needed {
        unsafe { *bufsize = needed };
        return -1;
    }
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, bytes.len()) };
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn fcntl_forwards_ordinary_commands() {
        let file = tempfile::tempfile().unwrap();
        let flags = lodge_fcntl(file.as_raw_fd(), libc::F_GETFL, std::ptr::null_mut());
        assert!(flags >= 0);
        assert_eq!(lodge_fcntl(-1, libc::F_GETFL, std::ptr::null_mut()), -1);
    }

    #[cfg(target_vendor = "apple")]
    #[test]
    fn signature_registration_reports_the_whole_file() {
        let file = tempfile::tempfile().unwrap();
        let mut start: libc::off_t = 0;
        let ret = lodge_fcntl(
            file.as_raw_fd(),
            F_ADDFILESIGS_RETURN,
            &mut start as *mut libc::off_t as *mut c_void,
        );
        assert_eq!(ret, 0);
        assert_eq!(start, WHOLE_FILE);
    }

    #[test]
    fn mmap_passes_through_successful_mappings() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"lodge").unwrap();
        let mapped = lodge_mmap(
            std::ptr::null_mut(),
            5,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        );
        assert_ne!(mapped, libc::MAP_FAILED);
        let bytes = unsafe { std::slice::from_raw_parts(mapped as *const u8, 5) };
        assert_eq!(bytes, b"lodge");
        unsafe { libc::munmap(mapped, 5) };
    }

    /// An `mmap` that refuses every executable mapping, as a signature-enforcing
    /// kernel does.
    unsafe extern "C" fn refusing_mmap(
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        if prot & libc::PROT_EXEC != 0 {
            crate::sys::set_errno(libc::EPERM);
            return libc::MAP_FAILED;
        }
        unsafe { libc::mmap(addr, len, prot, flags, fd, offset) }
    }

    fn errno() -> c_int {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    #[test]
    fn refused_executable_mapping_stands_without_bypass() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"guest code").unwrap();
        let page = crate::sys::page_size();
        let mut asked = false;
        let mapped = map_or_remap(
            refusing_mmap,
            || {
                asked = true;
                false
            },
            std::ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        );
        assert_eq!(mapped, libc::MAP_FAILED);
        assert_eq!(errno(), libc::EPERM);
        assert!(asked);
    }

    #[test]
    fn refused_executable_mapping_is_rebuilt_with_bypass() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"guest code").unwrap();
        let page = crate::sys::page_size();
        let mapped = map_or_remap(
            refusing_mmap,
            || true,
            std::ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        );
        assert_ne!(mapped, libc::MAP_FAILED);
        let bytes = unsafe { std::slice::from_raw_parts(mapped as *const u8, 10) };
        assert_eq!(bytes, b"guest code");
        unsafe { libc::munmap(mapped, page) };
    }

    #[test]
    fn non_executable_refusals_never_consult_the_bypass() {
        let mapped = map_or_remap(
            refusing_mmap,
            || panic!("bypass consulted"),
            std::ptr::null_mut(),
            crate::sys::page_size(),
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            -1,
            0,
        );
        assert_eq!(mapped, libc::MAP_FAILED);
    }

    #[test]
    fn anonymous_remap_copies_file_contents() {
        let page = crate::sys::page_size();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"guest code").unwrap();
        let mapped = unsafe {
            remap_anonymous(
                libc::mmap,
                std::ptr::null_mut(),
                page,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(mapped, libc::MAP_FAILED);
        let bytes = unsafe { std::slice::from_raw_parts(mapped as *const u8, page) };
        assert_eq!(&bytes[..10], b"guest code");
        assert!(bytes[10..].iter().all(|b| *b == 0));
        unsafe { libc::munmap(mapped, page) };
    }

    #[test]
    fn short_buffer_reports_needed_size() {
        let path = std::ffi::CString::new("/guest/tool").unwrap();
        let mut buf = [0 as c_char; 4];
        let mut size = buf.len() as u32;
        assert_eq!(unsafe { copy_path(&path, buf.as_mut_ptr(), &mut size) }, -1);
        assert_eq!(size, 12);

        let mut buf = [0 as c_char; 32];
        let mut size = buf.len() as u32;
        assert_eq!(unsafe { copy_path(&path, buf.as_mut_ptr(), &mut size) }, 0);
        let copied = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(copied, path.as_c_str());
    }
}

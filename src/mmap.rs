//! Memory-mapped file handling.
//!
//! The binary patcher reads guest executables through a private read-only
//! mapping so that classifying a large fat binary never copies it. Edits are
//! staged in an owned buffer taken from [`MappedFile::data`].

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A read-only memory-mapped file.
pub struct MappedFile {
    fd: libc::c_int,
    addr: *mut libc::c_void,
    size: usize,
}

// SAFETY: the mapping is private and read-only for its whole lifetime.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Open and map a regular file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<MappedFile> {
        let c_path = CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut statbuf) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if (statbuf.st_mode & libc::S_IFMT) != libc::S_IFREG {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        let size = statbuf.st_size as usize;
        if size == 0 {
            return Ok(Self {
                fd,
                addr: std::ptr::null_mut(),
                size,
            });
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd, addr, size })
    }

    pub fn data(&self) -> &[u8] {
        if self.addr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            if !self.addr.is_null() {
                libc::munmap(self.addr, self.size);
            }
            libc::close(self.fd);
        }
    }
}

//! XNU kernel interfaces: code-signing status and VM protection.

use crate::macho::{VM_PROT_COPY, VM_PROT_READ, VM_PROT_WRITE};
use std::io;
use tracing::trace;

type KernReturn = libc::c_int;
type MachPort = libc::c_uint;

const KERN_SUCCESS: KernReturn = 0;

const CS_OPS_STATUS: libc::c_uint = 0;
const CS_DEBUGGED: u32 = 0x1000_0000;

unsafe extern "C" {
    static mach_task_self_: MachPort;

    fn vm_protect(
        target_task: MachPort,
        address: usize,
        size: usize,
        set_maximum: libc::boolean_t,
        new_protection: libc::c_int,
    ) -> KernReturn;

    fn csops(
        pid: libc::pid_t,
        ops: libc::c_uint,
        useraddr: *mut libc::c_void,
        usersize: libc::size_t,
    ) -> libc::c_int;
}

fn protect(addr: usize, size: usize, prot: u32) -> io::Result<()> {
    let kr = unsafe { vm_protect(mach_task_self_, addr, size, 0, prot as libc::c_int) };
    if kr != KERN_SUCCESS {
        return Err(io::Error::other(format!("vm_protect({addr:#x}) failed: {kr}")));
    }
    Ok(())
}

/// Store `value` into a slot on a read-only page.
///
/// The page is remapped copy-on-write so shared-cache pages are never written
/// in place, then put back to read-only.
pub fn write_protected(slot: *mut usize, value: usize) -> io::Result<()> {
    let addr = slot as usize;
    let size = std::mem::size_of::<usize>();
    protect(addr, size, VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY)?;
    unsafe { std::ptr::write_volatile(slot, value) };
    trace!("wrote {value:#x} to protected slot {addr:#x}");
    protect(addr, size, VM_PROT_READ)
}

/// Whether a debugger is attached, per the kernel's code-signing flags.
pub fn is_debugged() -> bool {
    let mut flags: u32 = 0;
    let rc = unsafe {
        csops(
            libc::getpid(),
            CS_OPS_STATUS,
            &mut flags as *mut u32 as *mut libc::c_void,
            std::mem::size_of::<u32>(),
        )
    };
    rc == 0 && flags & CS_DEBUGGED != 0
}

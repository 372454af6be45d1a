//! Process-creation primitives redirected into the virtual kernel.
//!
//! With no spawner attached, or on a thread that suppressed interception,
//! every call goes to the real primitive unchanged.

use crate::guest;
use crate::kernel::{FileAction, Pid, SpawnOptions};
use libc::{c_char, c_int, pid_t, posix_spawn_file_actions_t};
use macros::interpose;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::CStr;
use tracing::{debug, warn};

/// Descriptor actions recorded per `posix_spawn_file_actions_t`, by address.
static FILE_ACTIONS: Mutex<BTreeMap<usize, Vec<FileAction>>> = Mutex::new(BTreeMap::new());

type PosixSpawnFn = unsafe extern "C" fn(
    *mut pid_t,
    *const c_char,
    *const libc::posix_spawn_file_actions_t,
    *const libc::posix_spawnattr_t,
    *const *mut c_char,
    *const *mut c_char,
) -> c_int;
type FileActionsFn = unsafe extern "C" fn(*mut posix_spawn_file_actions_t) -> c_int;
type AddDup2Fn = unsafe extern "C" fn(*mut posix_spawn_file_actions_t, c_int, c_int) -> c_int;
type AddCloseFn = unsafe extern "C" fn(*mut posix_spawn_file_actions_t, c_int) -> c_int;
type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
type WaitpidFn = unsafe extern "C" fn(pid_t, *mut c_int, c_int) -> pid_t;

/// Spawn a process; guest spawns become virtual processes.
#[interpose(guest)]
pub fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let Some(spawner) = guest::active_spawner() else {
        let real = unsafe { ORIG_POSIX_SPAWN.get::<PosixSpawnFn>() }.unwrap_or(libc::posix_spawn);
        return unsafe { real(pid, path, file_actions, attrp, argv, envp) };
    };
    let Some(path) = (unsafe { c_string(path) }) else {
        return libc::EINVAL;
    };
    let args = unsafe { c_string_array(argv as *const *const c_char) };
    let options = SpawnOptions {
        args: args.into_iter().skip(1).collect(),
        env: unsafe { env_map(envp as *const *const c_char) },
        file_actions: recorded_file_actions(file_actions),
        ..SpawnOptions::new(&path)
    };
    guest::note_redirect();
    match spawner.spawn(options) {
        Ok(vpid) => {
            debug!("posix_spawn({path}) -> virtual pid {vpid}");
            if !pid.is_null() {
                unsafe { *pid = vpid };
            }
            0
        }
        Err(err) => {
            warn!("posix_spawn({path}) rejected: {err}");
            err.errno()
        }
    }
}

fn recorded_file_actions(actions: *const posix_spawn_file_actions_t) -> Vec<FileAction> {
    if actions.is_null() {
        return Vec::new();
    }
    match FILE_ACTIONS.lock().get(&(actions as usize)) {
        Some(recorded) => recorded.clone(),
        None => {
            warn!("file actions at {actions:p} were built before interception; not carried over");
            Vec::new()
        }
    }
}

fn record(actions: *mut posix_spawn_file_actions_t, action: FileAction) {
    FILE_ACTIONS
        .lock()
        .entry(actions as usize)
        .or_default()
        .push(action);
}

#[interpose(guest)]
pub fn posix_spawn_file_actions_init(actions: *mut posix_spawn_file_actions_t) -> c_int {
    let real = unsafe { ORIG_POSIX_SPAWN_FILE_ACTIONS_INIT.get::<FileActionsFn>() }
        .unwrap_or(libc::posix_spawn_file_actions_init);
    let ret = unsafe { real(actions) };
    if ret == 0 {
        FILE_ACTIONS.lock().insert(actions as usize, Vec::new());
    }
    ret
}

#[interpose(guest)]
pub fn posix_spawn_file_actions_destroy(actions: *mut posix_spawn_file_actions_t) -> c_int {
    FILE_ACTIONS.lock().remove(&(actions as usize));
    let real = unsafe { ORIG_POSIX_SPAWN_FILE_ACTIONS_DESTROY.get::<FileActionsFn>() }
        .unwrap_or(libc::posix_spawn_file_actions_destroy);
    unsafe { real(actions) }
}

/// Record a `dup2` so a redirected spawn can replay the guest's pipe wiring.
#[interpose(guest)]
pub fn posix_spawn_file_actions_adddup2(
    actions: *mut posix_spawn_file_actions_t,
    fd: c_int,
    new_fd: c_int,
) -> c_int {
    let real = unsafe { ORIG_POSIX_SPAWN_FILE_ACTIONS_ADDDUP2.get::<AddDup2Fn>() }
        .unwrap_or(libc::posix_spawn_file_actions_adddup2);
    let ret = unsafe { real(actions, fd, new_fd) };
    if ret == 0 {
        record(actions, FileAction::Dup2 { fd, new_fd });
    }
    ret
}

#[interpose(guest)]
pub fn posix_spawn_file_actions_addclose(actions: *mut posix_spawn_file_actions_t, fd: c_int) -> c_int {
    let real = unsafe { ORIG_POSIX_SPAWN_FILE_ACTIONS_ADDCLOSE.get::<AddCloseFn>() }
        .unwrap_or(libc::posix_spawn_file_actions_addclose);
    let ret = unsafe { real(actions, fd) };
    if ret == 0 {
        record(actions, FileAction::Close { fd });
    }
    ret
}

/// Replace the process image; a guest exec runs the new image as a virtual
/// process and exits with its status.
#[interpose(guest)]
pub fn execve(path: *const c_char, argv: *const *const c_char, envp: *const *const c_char) -> c_int {
    let Some(spawner) = guest::active_spawner() else {
        let real = unsafe { ORIG_EXECVE.get::<ExecveFn>() }.unwrap_or(libc::execve);
        return unsafe { real(path, argv, envp) };
    };
    let Some(path) = (unsafe { c_string(path) }) else {
        crate::sys::set_errno(libc::EFAULT);
        return -1;
    };
    let args = unsafe { c_string_array(argv) };
    let options = SpawnOptions {
        args: args.into_iter().skip(1).collect(),
        env: unsafe { env_map(envp) },
        ..SpawnOptions::new(&path)
    };
    guest::note_redirect();
    let pid = match spawner.spawn(options) {
        Ok(pid) => pid,
        Err(err) => {
            warn!("execve({path}) rejected: {err}");
            crate::sys::set_errno(err.errno());
            return -1;
        }
    };
    let code = match spawner.wait(pid, true) {
        Ok(code) => code.unwrap_or(0),
        Err(err) => {
            warn!("execve({path}): lost virtual pid {pid}: {err}");
            1
        }
    };
    debug!("execve({path}) finished with {code}");
    unsafe { libc::_exit(code) }
}

/// Wait for a process; virtual pids are answered by the kernel.
#[interpose(guest)]
pub fn waitpid(pid: pid_t, status: *mut c_int, options: c_int) -> pid_t {
    if let Some(spawner) = guest::active_spawner() {
        if pid > 0 && spawner.owns(pid) {
            return wait_virtual(spawner.as_ref(), pid, status, options);
        }
    }
    let real = unsafe { ORIG_WAITPID.get::<WaitpidFn>() }.unwrap_or(libc::waitpid);
    unsafe { real(pid, status, options) }
}

fn wait_virtual(spawner: &dyn guest::GuestSpawner, pid: Pid, status: *mut c_int, options: c_int) -> pid_t {
    match spawner.wait(pid, options & libc::WNOHANG == 0) {
        Ok(Some(code)) => {
            if !status.is_null() {
                unsafe { *status = wait_status(code) };
            }
            pid
        }
        Ok(None) => 0,
        Err(err) => {
            debug!("waitpid({pid}): {err}");
            crate::sys::set_errno(libc::ECHILD);
            -1
        }
    }
}

/// Encode an exit code the way `WEXITSTATUS` decodes it.
pub fn wait_status(code: i32) -> c_int {
    (code & 0xff) << 8
}

unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Collect a NULL-terminated array of C strings.
unsafe fn c_string_array(mut ptr: *const *const c_char) -> Vec<String> {
    let mut out = Vec::new();
    if ptr.is_null() {
        return out;
    }
    loop {
        let item = unsafe { *ptr };
        if item.is_null() {
            break;
        }
        out.extend(unsafe { c_string(item) });
        ptr = unsafe { ptr.add(1) };
    }
    out
}

/// Parse `KEY=VALUE` entries; entries without `=` are dropped.
unsafe fn env_map(envp: *const *const c_char) -> BTreeMap<String, String> {
    unsafe { c_string_array(envp) }
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn c_array(items: &[&str]) -> (Vec<CString>, Vec<*const c_char>) {
        let owned: Vec<CString> = items.iter().map(|s| CString::new(*s).unwrap()).collect();
        let mut ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        (owned, ptrs)
    }

    #[test]
    fn collects_null_terminated_arrays() {
        let (_owned, ptrs) = c_array(&["/bin/echo", "hi", "there"]);
        assert_eq!(unsafe { c_string_array(ptrs.as_ptr()) }, ["/bin/echo", "hi", "there"]);
        assert!(unsafe { c_string_array(std::ptr::null()) }.is_empty());
    }

    #[test]
    fn parses_environment_entries() {
        let (_owned, ptrs) = c_array(&["HOME=/var/guest", "EMPTY=", "BROKEN", "A=b=c"]);
        let env = unsafe { env_map(ptrs.as_ptr()) };
        assert_eq!(env.len(), 3);
        assert_eq!(env["HOME"], "/var/guest");
        assert_eq!(env["EMPTY"], "");
        assert_eq!(env["A"], "b=c");
    }

    #[test]
    fn wait_status_decodes_with_wexitstatus() {
        let status = wait_status(3);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 3);
    }

    #[test]
    fn file_actions_are_recorded_until_destroyed() {
        let mut actions: posix_spawn_file_actions_t = unsafe { std::mem::zeroed() };
        let ptr = &mut actions as *mut posix_spawn_file_actions_t;
        assert_eq!(lodge_posix_spawn_file_actions_init(ptr), 0);
        assert!(recorded_file_actions(ptr).is_empty());

        assert_eq!(lodge_posix_spawn_file_actions_adddup2(ptr, 7, 1), 0);
        assert_eq!(lodge_posix_spawn_file_actions_addclose(ptr, 7), 0);
        assert_ne!(lodge_posix_spawn_file_actions_adddup2(ptr, -1, 1), 0);
        assert_eq!(
            recorded_file_actions(ptr),
            [FileAction::Dup2 { fd: 7, new_fd: 1 }, FileAction::Close { fd: 7 }]
        );

        assert_eq!(lodge_posix_spawn_file_actions_destroy(ptr), 0);
        assert!(recorded_file_actions(ptr).is_empty());
        assert!(recorded_file_actions(std::ptr::null()).is_empty());
    }

    #[test]
    fn waitpid_forwards_unknown_pids() {
        // No children: the real primitive reports ECHILD.
        let ret = lodge_waitpid(0x7fff_fff0, std::ptr::null_mut(), libc::WNOHANG);
        assert_eq!(ret, -1);
    }
}

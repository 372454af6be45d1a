//! Guest execution inside a worker.
//!
//! The worker connects to the kernel's output channel, presents the request
//! token, and then runs the guest with its stdout and stderr on that
//! connection. A guest either runs as a child process or, when the request
//! asks for it, is loaded into the worker with `dlopen` and its `main` called
//! on a thread.

use crate::bypass;
use crate::guest::SuppressGuard;
use crate::kernel::{EXIT_LOST, FileAction, SpawnRequest, exit_code};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::process::CommandExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("cannot connect to output channel {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error("cannot start {}: {source}", path.display())]
    Start { path: PathBuf, source: io::Error },

    #[error("cannot load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("malformed spawn request: {0}")]
    Payload(#[from] serde_json::Error),
}

static ORIGINAL_STDERR: OnceLock<Option<File>> = OnceLock::new();

/// The stderr this process had when [`OriginalStderr::capture`] first ran.
///
/// A module guest gets fd 2 pointed at its output stream; log lines written
/// here stay off that stream.
#[derive(Clone, Copy, Debug)]
pub struct OriginalStderr;

impl OriginalStderr {
    /// Save a close-on-exec duplicate of the current fd 2.
    pub fn capture() -> Self {
        ORIGINAL_STDERR.get_or_init(|| {
            let fd = unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_DUPFD_CLOEXEC, 3) };
            (fd >= 0).then(|| unsafe { File::from_raw_fd(fd) })
        });
        Self
    }

    fn file() -> Option<&'static File> {
        ORIGINAL_STDERR.get().and_then(Option::as_ref)
    }
}

impl Write for OriginalStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Self::file() {
            Some(mut file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Self::file() {
            Some(mut file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

type MainFn = unsafe extern "C" fn(c_int, *const *const c_char, *const *const c_char) -> c_int;

/// A guest that is running.
#[derive(Debug)]
pub enum LaunchedGuest {
    Child(Child),
    Module(JoinHandle<i32>),
}

impl LaunchedGuest {
    /// OS pid of a child guest.
    pub fn id(&self) -> Option<u32> {
        match self {
            LaunchedGuest::Child(child) => Some(child.id()),
            LaunchedGuest::Module(_) => None,
        }
    }

    /// Wait for the guest and return its exit code.
    pub fn wait(self) -> i32 {
        match self {
            LaunchedGuest::Child(mut child) => child.wait().map(exit_code).unwrap_or(EXIT_LOST),
            LaunchedGuest::Module(handle) => handle.join().unwrap_or(EXIT_LOST),
        }
    }
}

/// Open the output stream for `request` and send the handshake line.
pub fn connect(request: &SpawnRequest) -> Result<UnixStream, RunnerError> {
    let failed = |source| RunnerError::Connect {
        path: request.channel.clone(),
        source,
    };
    let mut stream = UnixStream::connect(&request.channel).map_err(failed)?;
    writeln!(stream, "{}", request.request_id).map_err(failed)?;
    Ok(stream)
}

/// Connect and start the guest.
pub fn launch(request: &SpawnRequest) -> Result<LaunchedGuest, RunnerError> {
    let stream = connect(request)?;
    if request.in_process {
        load_module(request, stream)
    } else {
        start_child(request, stream)
    }
}

/// Run the guest to completion.
pub fn run(request: &SpawnRequest) -> Result<i32, RunnerError> {
    let code = launch(request)?.wait();
    info!("guest {} exited with {code}", request.path.display());
    Ok(code)
}

fn start_child(request: &SpawnRequest, stream: UnixStream) -> Result<LaunchedGuest, RunnerError> {
    let failed = |source| RunnerError::Start {
        path: request.path.clone(),
        source,
    };
    let stdout = OwnedFd::from(stream);
    let stderr = stdout.try_clone().map_err(failed)?;

    let mut command = Command::new(&request.path);
    command
        .args(&request.args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(dir) = &request.working_directory {
        command.current_dir(dir);
    }
    if !request.file_actions.is_empty() {
        let actions = request.file_actions.clone();
        // SAFETY: the hook only issues dup2, fcntl and close.
        unsafe { command.pre_exec(move || apply_file_actions(&actions)) };
    }
    let child = {
        let _suppress = SuppressGuard::new();
        command.spawn().map_err(failed)?
    };
    // Our copies of the socket go with the command; the stream ends when the
    // child's do.
    drop(command);
    debug!("guest {} running as {}", request.path.display(), child.id());
    Ok(LaunchedGuest::Child(child))
}

/// Apply `actions` to this process's descriptors, in order. Runs between
/// fork and exec.
fn apply_file_actions(actions: &[FileAction]) -> io::Result<()> {
    for action in actions {
        match *action {
            FileAction::Dup2 { fd, new_fd } if fd == new_fd => {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
                if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            FileAction::Dup2 { fd, new_fd } => {
                if unsafe { libc::dup2(fd, new_fd) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            FileAction::Close { fd } => {
                unsafe { libc::close(fd) };
            }
        }
    }
    Ok(())
}

fn dlerror() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown loader error".into();
    }
    unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
}

fn c_path(path: &Path) -> Result<CString, RunnerError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| RunnerError::Load {
        path: path.to_path_buf(),
        reason: "path contains a NUL byte".into(),
    })
}

/// Load the guest into this process and call its `main` on a thread. The
/// process's stdout and stderr point at the stream until `main` returns.
fn load_module(request: &SpawnRequest, stream: UnixStream) -> Result<LaunchedGuest, RunnerError> {
    let load_failed = |reason: String| RunnerError::Load {
        path: request.path.clone(),
        reason,
    };
    let path = c_path(&request.path)?;
    if !request.file_actions.is_empty() {
        warn!(
            "{} descriptor action(s) for {} not applied: a module guest shares our descriptors",
            request.file_actions.len(),
            request.path.display()
        );
    }
    bypass::set_guest_executable_path(&request.path).map_err(|err| load_failed(err.to_string()))?;

    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        return Err(load_failed(dlerror()));
    }
    let entry = unsafe { libc::dlsym(handle, c"main".as_ptr()) };
    if entry.is_null() {
        return Err(load_failed("no main symbol".into()));
    }
    let main: MainFn = unsafe { std::mem::transmute::<*mut libc::c_void, MainFn>(entry) };

    if let Some(dir) = &request.working_directory {
        std::env::set_current_dir(dir).map_err(|err| load_failed(err.to_string()))?;
    }
    for (key, value) in &request.env {
        // SAFETY: the worker runs one guest and starts no other threads that
        // read the environment.
        unsafe { std::env::set_var(key, value) };
    }

    let mut argv = vec![path];
    for arg in &request.args {
        argv.push(CString::new(arg.as_bytes()).map_err(|err| load_failed(err.to_string()))?);
    }
    let envp: Vec<CString> = std::env::vars_os()
        .filter_map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            CString::new(entry).ok()
        })
        .collect();

    let saved = unsafe { [libc::dup(libc::STDOUT_FILENO), libc::dup(libc::STDERR_FILENO)] };
    unsafe {
        libc::dup2(stream.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(stream.as_raw_fd(), libc::STDERR_FILENO);
    }
    drop(stream);
    debug!("guest {} loaded in process", request.path.display());

    let guest = std::thread::Builder::new()
        .name("lodge-guest-main".into())
        .spawn(move || {
            let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());
            let mut envp_ptrs: Vec<*const c_char> = envp.iter().map(|var| var.as_ptr()).collect();
            envp_ptrs.push(std::ptr::null());
            let code = unsafe { main(argv.len() as c_int, argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
            unsafe {
                libc::fflush(std::ptr::null_mut());
                restore_stdio(saved);
            }
            code
        });
    match guest {
        Ok(handle) => Ok(LaunchedGuest::Module(handle)),
        Err(err) => {
            unsafe { restore_stdio(saved) };
            Err(RunnerError::Start {
                path: request.path.clone(),
                source: err,
            })
        }
    }
}

/// Put back the stdout and stderr saved before a module guest ran.
unsafe fn restore_stdio(saved: [c_int; 2]) {
    for (saved, target) in saved.into_iter().zip([libc::STDOUT_FILENO, libc::STDERR_FILENO]) {
        if saved >= 0 {
            unsafe {
                libc::dup2(saved, target);
                libc::close(saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RequestId;
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Read};
    use std::os::unix::net::UnixListener;

    fn request(channel: PathBuf, path: &str, args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            request_id: RequestId::random(),
            path: path.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: BTreeMap::new(),
            working_directory: None,
            channel,
            in_process: false,
            file_actions: Vec::new(),
        }
    }

    /// A pipe whose ends close on exec.
    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Accept one connection, check its token and return the rest.
    fn read_stream(listener: &UnixListener, token: RequestId) -> String {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, format!("{token}\n"));
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        rest
    }

    #[test]
    fn child_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("k.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let request = request(socket, "/bin/sh", &["-c", "echo out; echo err >&2; exit 4"]);

        let guest = launch(&request).unwrap();
        assert!(guest.id().is_some());
        assert_eq!(read_stream(&listener, request.request_id), "out\nerr\n");
        assert_eq!(guest.wait(), 4);
    }

    #[test]
    fn child_sees_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("k.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let mut request = request(socket, "/bin/sh", &["-c", "printf '%s ' \"$LODGE_TEST\"; pwd -P"]);
        request.env.insert("LODGE_TEST".into(), "visible".into());
        request.working_directory = Some(dir.path().to_path_buf());

        let guest = launch(&request).unwrap();
        let expected = format!("visible {}\n", dir.path().canonicalize().unwrap().display());
        assert_eq!(read_stream(&listener, request.request_id), expected);
        assert_eq!(guest.wait(), 0);
    }

    #[test]
    fn child_stdout_follows_requested_dup2() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("k.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (read_end, write_end) = pipe();
        let mut request = request(socket, "/bin/sh", &["-c", "echo piped; echo err >&2"]);
        request.file_actions = vec![
            FileAction::Dup2 {
                fd: write_end.as_raw_fd(),
                new_fd: libc::STDOUT_FILENO,
            },
            FileAction::Close {
                fd: write_end.as_raw_fd(),
            },
        ];

        let guest = launch(&request).unwrap();
        drop(write_end);
        assert_eq!(read_stream(&listener, request.request_id), "err\n");
        let mut piped = String::new();
        File::from(read_end).read_to_string(&mut piped).unwrap();
        assert_eq!(piped, "piped\n");
        assert_eq!(guest.wait(), 0);
    }

    #[test]
    fn missing_channel_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(dir.path().join("absent.sock"), "/bin/sh", &[]);
        assert!(matches!(launch(&request), Err(RunnerError::Connect { .. })));
    }

    #[test]
    fn original_stderr_is_a_separate_descriptor_for_the_same_file() {
        OriginalStderr::capture();
        let saved = OriginalStderr::file().unwrap();
        assert_ne!(saved.as_raw_fd(), libc::STDERR_FILENO);

        let mut ours: libc::stat = unsafe { std::mem::zeroed() };
        let mut theirs: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(saved.as_raw_fd(), &mut ours) }, 0);
        assert_eq!(unsafe { libc::fstat(libc::STDERR_FILENO, &mut theirs) }, 0);
        assert_eq!((ours.st_dev, ours.st_ino), (theirs.st_dev, theirs.st_ino));

        let flags = unsafe { libc::fcntl(saved.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn missing_guest_is_a_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("k.sock");
        let _listener = UnixListener::bind(&socket).unwrap();
        let request = request(socket, "/nonexistent/guest", &[]);
        assert!(matches!(launch(&request), Err(RunnerError::Start { .. })));
    }
}

//! Process table and IPC kernel.
//!
//! The kernel owns the table of virtual processes and starts guests through a
//! [`Worker`]. Everything a caller observes goes out as [`KernelEvent`]s; for
//! any pid the spawned event comes first and the exited event at most once.
//!
//! ```no_run
//! use lodge::kernel::Kernel;
//!
//! let kernel = Kernel::builder().app_group_identifier("group.example").build();
//! let pid = kernel.spawn("/bin/echo", vec!["hi".into()], Default::default()).wait()?;
//! assert_eq!(kernel.wait(pid)?, 0);
//! # Ok::<(), lodge::kernel::KernelError>(())
//! ```

mod channel;
mod event;
mod process;
mod table;
mod worker;

pub use channel::{ChannelSink, OutputChannel};
pub use event::{EventBus, KernelEvent};
pub use process::{FIRST_VIRTUAL_PID, ParseRequestIdError, Pid, Process, ProcessState, RequestId};
pub use table::ProcessTable;
pub use worker::{EXIT_LOST, FileAction, Launched, ProcessWorker, SpawnRequest, ThreadWorker, Worker, exit_code};

use crate::guest::{self, GuestSpawner};
use crate::install::Install;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_APP_GROUP: &str = "group.lodge.kernel";

pub const DEFAULT_EXTENSION: &str = "lodge-runner";

/// How long a recorded exit waits for the output stream to connect or drain.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("worker extension {0:?} not found")]
    ExtensionNotFound(String),

    #[error("worker extension failed to load: {0}")]
    ExtensionLoadFailed(String),

    #[error("cannot create output channel: {0}")]
    SocketCreationFailed(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("invalid executable path {0:?}")]
    InvalidPath(PathBuf),

    #[error("no process with pid {0}")]
    ProcessNotFound(Pid),

    #[error("request {0} is already in flight")]
    DuplicateRequest(RequestId),

    #[error("pid {0} is already registered")]
    PidInUse(Pid),

    #[error("kernel is shut down")]
    ShutDown,
}

impl KernelError {
    /// Stable numeric code.
    pub fn code(&self) -> i32 {
        match self {
            KernelError::ExtensionNotFound(_) => 1,
            KernelError::ExtensionLoadFailed(_) => 2,
            KernelError::SocketCreationFailed(_) => 3,
            KernelError::SpawnFailed(_) => 4,
            KernelError::InvalidPath(_) => 5,
            KernelError::ProcessNotFound(_) => 6,
            KernelError::DuplicateRequest(_) => 7,
            KernelError::PidInUse(_) => 8,
            KernelError::ShutDown => 9,
        }
    }

    /// The errno a C caller sees for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            KernelError::ExtensionNotFound(_) => libc::ENOSYS,
            KernelError::ExtensionLoadFailed(_) => libc::ENOEXEC,
            KernelError::SocketCreationFailed(_) => libc::EIO,
            KernelError::SpawnFailed(_) => libc::EAGAIN,
            KernelError::InvalidPath(_) => libc::ENOENT,
            KernelError::ProcessNotFound(_) => libc::ESRCH,
            KernelError::DuplicateRequest(_) | KernelError::PidInUse(_) => libc::EEXIST,
            KernelError::ShutDown => libc::ESHUTDOWN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Names the container directory shared with workers.
    pub app_group_identifier: String,
    /// Names the worker executable.
    pub extension_identifier: String,
    pub container_root: PathBuf,
    /// Where the worker executable is looked up, in order.
    pub extension_dirs: Vec<PathBuf>,
    /// Ask workers to load guests as modules instead of starting them.
    pub load_in_process: bool,
    /// Longest an exit is held back for the process's output stream.
    pub exit_grace: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            app_group_identifier: DEFAULT_APP_GROUP.to_string(),
            extension_identifier: DEFAULT_EXTENSION.to_string(),
            container_root: std::env::temp_dir(),
            extension_dirs: exe_dir.into_iter().collect(),
            load_in_process: false,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

impl KernelConfig {
    pub fn container_dir(&self) -> PathBuf {
        self.container_root.join(&self.app_group_identifier)
    }
}

#[derive(Default)]
pub struct KernelBuilder {
    config: KernelConfig,
    worker: Option<Box<dyn Worker>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn app_group_identifier(mut self, id: impl Into<String>) -> Self {
        self.config.app_group_identifier = id.into();
        self
    }

    pub fn extension_identifier(mut self, id: impl Into<String>) -> Self {
        self.config.extension_identifier = id.into();
        self
    }

    pub fn container_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.container_root = root.into();
        self
    }

    pub fn extension_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.config.extension_dirs = dirs;
        self
    }

    pub fn load_in_process(mut self, load_in_process: bool) -> Self {
        self.config.load_in_process = load_in_process;
        self
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.config.exit_grace = grace;
        self
    }

    /// Run guests through `worker` instead of a [`ProcessWorker`] built from
    /// the configuration.
    pub fn worker(mut self, worker: impl Worker + 'static) -> Self {
        self.worker = Some(Box::new(worker));
        self
    }

    pub fn build(self) -> Kernel {
        let worker = self.worker.unwrap_or_else(|| {
            Box::new(ProcessWorker::new(
                self.config.extension_identifier.clone(),
                self.config.extension_dirs.clone(),
            ))
        });
        Kernel {
            inner: Arc::new(Inner {
                config: self.config,
                table: Mutex::new(ProcessTable::new()),
                events: EventBus::new(),
                channel: Mutex::new(None),
                worker,
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    config: KernelConfig,
    table: Mutex<ProcessTable>,
    events: EventBus,
    channel: Mutex<Option<OutputChannel>>,
    worker: Box<dyn Worker>,
    shut_down: AtomicBool,
}

impl Inner {
    fn exit_for_request(self: &Arc<Self>, request_id: RequestId, exit_code: i32) {
        let pid = self.table.lock().pid_for_request(request_id);
        match pid {
            Some(pid) => {
                if self.record_exit(pid, exit_code) {
                    info!("process {pid} exited with {exit_code}");
                }
            }
            None => debug!("exit for unknown request {request_id} dropped"),
        }
    }

    /// Record an exit; one held back for the output stream is published
    /// after the configured grace at the latest.
    fn record_exit(self: &Arc<Self>, pid: Pid, exit_code: i32) -> bool {
        let held = {
            let mut table = self.table.lock();
            if !table.record_exit(pid, exit_code, &self.events) {
                return false;
            }
            match table.get(pid) {
                Some(process) if table.exit_held(pid) => Some(process.request_id),
                _ => None,
            }
        };
        if let Some(request_id) = held {
            self.expire_exit_later(pid, request_id);
        }
        true
    }

    fn expire_exit_later(self: &Arc<Self>, pid: Pid, request_id: RequestId) {
        let inner = Arc::downgrade(self);
        let grace = self.config.exit_grace;
        let timer = std::thread::Builder::new()
            .name("lodge-exit".into())
            .spawn(move || {
                std::thread::sleep(grace);
                if let Some(inner) = inner.upgrade() {
                    inner.table.lock().expire_exit(pid, request_id, &inner.events);
                }
            });
        if let Err(err) = timer {
            warn!("no exit timer for {pid}, publishing now: {err}");
            self.table.lock().expire_exit(pid, request_id, &self.events);
        }
    }
}

/// Channel callbacks, holding the kernel weakly so an idle channel does not
/// keep it alive.
struct KernelSink(Weak<Inner>);

impl ChannelSink for KernelSink {
    fn connected(&self, token: RequestId) -> Option<Pid> {
        let inner = self.0.upgrade()?;
        let mut table = inner.table.lock();
        let pid = table.pid_for_request(token)?;
        table.open_stream(pid).then_some(pid)
    }

    fn output(&self, pid: Pid, bytes: Vec<u8>) {
        if let Some(inner) = self.0.upgrade() {
            inner.table.lock().output(pid, bytes, &inner.events);
        }
    }

    fn closed(&self, pid: Pid) {
        if let Some(inner) = self.0.upgrade() {
            inner.table.lock().close_stream(pid, &inner.events);
        }
    }
}

/// Handed to a worker with each request; reports the guest's exit.
#[derive(Debug)]
pub struct ExitSink {
    inner: Weak<Inner>,
    request_id: RequestId,
}

impl ExitSink {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn exited(self, exit_code: i32) {
        match self.inner.upgrade() {
            Some(inner) => inner.exit_for_request(self.request_id, exit_code),
            None => debug!("exit for {} after kernel drop", self.request_id),
        }
    }
}

/// A spawn, in full.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    /// Parent pid recorded on the process; the host pid when unset.
    pub parent: Option<Pid>,
    /// Correlation token; a random one when unset.
    pub request_id: Option<RequestId>,
    pub file_actions: Vec<FileAction>,
}

impl SpawnOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn parent(mut self, ppid: Pid) -> Self {
        self.parent = Some(ppid);
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn file_action(mut self, action: FileAction) -> Self {
        self.file_actions.push(action);
        self
    }
}

/// The single-shot result of [`Kernel::spawn`].
#[must_use = "the spawn result is only available through the completion"]
#[derive(Debug)]
pub struct SpawnCompletion {
    rx: Receiver<Result<Pid, KernelError>>,
}

impl SpawnCompletion {
    fn ready(result: Result<Pid, KernelError>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    fn lost() -> KernelError {
        KernelError::SpawnFailed("spawn thread exited without a result".into())
    }

    /// Block until the spawn has succeeded or failed.
    pub fn wait(self) -> Result<Pid, KernelError> {
        self.rx.recv().unwrap_or_else(|_| Err(Self::lost()))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Pid, KernelError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Self::lost())),
        }
    }

    pub fn try_result(&self) -> Option<Result<Pid, KernelError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Self::lost())),
        }
    }

    /// The underlying receiver, for `select!`.
    pub fn receiver(&self) -> &Receiver<Result<Pid, KernelError>> {
        &self.rx
    }
}

/// Handle to a kernel. Clones share the same table.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.inner.config)
            .field("processes", &self.inner.table.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: OnceLock<Kernel> = OnceLock::new();

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn new() -> Self {
        KernelBuilder::new().build()
    }

    /// The process-wide kernel, built with the default configuration on
    /// first use.
    pub fn shared() -> &'static Kernel {
        SHARED.get_or_init(Kernel::new)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), KernelError> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }
        Ok(())
    }

    /// Start `path` as a new virtual process. The result arrives through the
    /// returned completion once the worker has accepted or refused it.
    pub fn spawn(
        &self,
        path: impl Into<PathBuf>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> SpawnCompletion {
        self.spawn_with(SpawnOptions {
            args,
            env,
            ..SpawnOptions::new(path)
        })
    }

    pub fn spawn_with(&self, options: SpawnOptions) -> SpawnCompletion {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let kernel = self.clone();
        let spawned = std::thread::Builder::new()
            .name("lodge-spawn".into())
            .spawn(move || {
                let _ = tx.send(kernel.spawn_now(options));
            });
        match spawned {
            Ok(_) => SpawnCompletion { rx },
            Err(err) => SpawnCompletion::ready(Err(KernelError::SpawnFailed(err.to_string()))),
        }
    }

    /// Spawn on the calling thread, blocking until the worker has answered.
    pub fn spawn_now(&self, options: SpawnOptions) -> Result<Pid, KernelError> {
        self.ensure_running()?;
        if options.path.as_os_str().is_empty() || !options.path.is_file() {
            return Err(KernelError::InvalidPath(options.path));
        }
        let channel = self.ensure_channel()?;

        let mut process = Process::new(options.path.clone());
        process.args = options.args.clone();
        process.env = options.env.clone();
        process.working_directory = options.working_directory.clone();
        if let Some(ppid) = options.parent {
            process.ppid = ppid;
        }
        if let Some(request_id) = options.request_id {
            process.request_id = request_id;
        }
        let request_id = process.request_id;
        let request = SpawnRequest {
            request_id,
            path: options.path,
            args: options.args,
            env: options.env,
            working_directory: options.working_directory,
            channel,
            in_process: self.inner.config.load_in_process,
            file_actions: options.file_actions,
        };

        let pid = {
            let mut table = self.inner.table.lock();
            // Shutdown clears the table under this lock; nothing may be
            // inserted after it.
            self.ensure_running()?;
            let pid = table.insert(process)?;
            table.expect_stream(pid);
            pid
        };
        debug!("launching {} as {pid}", request.path.display());
        let exits = ExitSink {
            inner: Arc::downgrade(&self.inner),
            request_id,
        };
        match self.inner.worker.launch(request, exits) {
            Ok(launched) => {
                let announced = self
                    .inner
                    .table
                    .lock()
                    .announce(pid, launched.physical_pid, &self.inner.events);
                if !announced && self.is_shut_down() {
                    warn!("kernel shut down while {pid} was launching");
                    return Err(KernelError::ShutDown);
                }
                info!("spawned {pid} (physical {:?})", launched.physical_pid);
                Ok(pid)
            }
            Err(err) => {
                self.inner.table.lock().remove(pid);
                warn!("spawn of {pid} failed: {err}");
                Err(err)
            }
        }
    }

    /// The output channel socket, bound on first use.
    fn ensure_channel(&self) -> Result<PathBuf, KernelError> {
        let mut channel = self.inner.channel.lock();
        self.ensure_running()?;
        if let Some(channel) = channel.as_ref() {
            return Ok(channel.path().to_path_buf());
        }
        let sink = Arc::new(KernelSink(Arc::downgrade(&self.inner)));
        let bound = OutputChannel::bind(&self.inner.config.container_dir(), sink)?;
        let path = bound.path().to_path_buf();
        *channel = Some(bound);
        Ok(path)
    }

    /// Add a process started elsewhere. A pid of 0 gets one allocated.
    pub fn register(&self, process: Process) -> Result<Pid, KernelError> {
        let physical_pid = process.physical_pid;
        let mut table = self.inner.table.lock();
        self.ensure_running()?;
        let pid = table.insert(process)?;
        table.announce(pid, physical_pid, &self.inner.events);
        Ok(pid)
    }

    /// Remove `pid`; unknown pids are ignored.
    pub fn unregister(&self, pid: Pid) -> Option<Process> {
        self.inner.table.lock().remove(pid)
    }

    pub fn process(&self, pid: Pid) -> Result<Process, KernelError> {
        self.inner
            .table
            .lock()
            .get(pid)
            .cloned()
            .ok_or(KernelError::ProcessNotFound(pid))
    }

    pub fn process_for_request(&self, request_id: RequestId) -> Option<Process> {
        let table = self.inner.table.lock();
        let pid = table.pid_for_request(request_id)?;
        table.get(pid).cloned()
    }

    pub fn all_processes(&self) -> Vec<Process> {
        self.inner.table.lock().processes()
    }

    /// Record that `pid` exited. Returns false for unknown pids and repeated
    /// exits.
    pub fn handle_exit(&self, pid: Pid, exit_code: i32) -> bool {
        let recorded = self.inner.record_exit(pid, exit_code);
        if !recorded {
            debug!("exit for {pid} dropped");
        }
        recorded
    }

    /// Exit code of `pid`, or `None` while it runs.
    pub fn try_wait(&self, pid: Pid) -> Result<Option<i32>, KernelError> {
        self.ensure_running()?;
        self.process(pid).map(|process| process.exit_code())
    }

    /// Block until `pid` has exited.
    pub fn wait(&self, pid: Pid) -> Result<i32, KernelError> {
        let events = self.subscribe();
        loop {
            if let Some(code) = self.try_wait(pid)? {
                return Ok(code);
            }
            if events.recv().is_err() {
                return Err(KernelError::ShutDown);
            }
        }
    }

    /// A receiver for every event published from now on.
    pub fn subscribe(&self) -> Receiver<KernelEvent> {
        if self.is_shut_down() {
            let (_, rx) = crossbeam_channel::unbounded();
            return rx;
        }
        self.inner.events.subscribe()
    }

    /// Run `observer` for each output chunk, on a dispatcher thread of its
    /// own. The thread ends when the kernel shuts down or is dropped.
    pub fn on_output<F>(&self, observer: F) -> std::io::Result<JoinHandle<()>>
    where
        F: Fn(Pid, &[u8]) + Send + 'static,
    {
        let events = self.subscribe();
        std::thread::Builder::new()
            .name("lodge-output".into())
            .spawn(move || {
                for event in events {
                    if let KernelEvent::Output { pid, bytes } = event {
                        observer(pid, &bytes);
                    }
                }
            })
    }

    /// Close the channel, forget every process and disconnect subscribers.
    /// Every later operation fails with [`KernelError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self.inner.channel.lock().take();
        drop(channel);
        self.inner.table.lock().clear();
        self.inner.events.close();
        info!("kernel shut down");
    }

    /// Route guest process creation in this process to this kernel.
    pub fn attach_guest_hooks(&self) -> Install {
        guest::set_spawner(Arc::new(self.clone()));
        guest::install_hooks()
    }
}

impl GuestSpawner for Kernel {
    fn spawn(&self, options: SpawnOptions) -> Result<Pid, KernelError> {
        self.spawn_now(options)
    }

    fn owns(&self, pid: Pid) -> bool {
        self.inner.table.lock().contains(pid)
    }

    fn wait(&self, pid: Pid, block: bool) -> Result<Option<i32>, KernelError> {
        if block {
            Kernel::wait(self, pid).map(Some)
        } else {
            self.try_wait(pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct FakeWorker {
        launched: Sender<(SpawnRequest, ExitSink)>,
        refuse: Option<KernelError>,
    }

    impl Worker for FakeWorker {
        fn launch(&self, request: SpawnRequest, exits: ExitSink) -> Result<Launched, KernelError> {
            if let Some(err) = &self.refuse {
                return Err(err.clone());
            }
            let _ = self.launched.send((request, exits));
            Ok(Launched {
                physical_pid: Some(4242),
            })
        }
    }

    fn kernel_with(
        container: &Path,
        refuse: Option<KernelError>,
    ) -> (Kernel, Receiver<(SpawnRequest, ExitSink)>) {
        kernel_with_grace(container, refuse, Duration::from_millis(200))
    }

    fn kernel_with_grace(
        container: &Path,
        refuse: Option<KernelError>,
        grace: Duration,
    ) -> (Kernel, Receiver<(SpawnRequest, ExitSink)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let kernel = Kernel::builder()
            .container_root(container)
            .exit_grace(grace)
            .worker(FakeWorker { launched: tx, refuse })
            .build();
        (kernel, rx)
    }

    fn guest_path() -> PathBuf {
        std::env::current_exe().unwrap()
    }

    fn next(events: &Receiver<KernelEvent>) -> KernelEvent {
        events.recv_timeout(TIMEOUT).unwrap()
    }

    #[test]
    fn spawn_announces_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with(dir.path(), None);
        let events = kernel.subscribe();

        let pid = kernel
            .spawn(guest_path(), vec!["hi".into()], BTreeMap::new())
            .wait()
            .unwrap();
        assert!(pid >= FIRST_VIRTUAL_PID);
        let (request, exits) = launched.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(request.args, ["hi"]);
        assert!(request.channel.starts_with(dir.path().join(DEFAULT_APP_GROUP)));
        assert_eq!(kernel.process(pid).unwrap().physical_pid, Some(4242));
        assert_eq!(kernel.try_wait(pid).unwrap(), None);

        exits.exited(3);
        assert_eq!(next(&events), KernelEvent::Spawned { pid });
        assert_eq!(next(&events), KernelEvent::Exited { pid, exit_code: 3 });
        assert_eq!(kernel.wait(pid).unwrap(), 3);
    }

    #[test]
    fn worker_errors_reach_the_caller_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let refusal = KernelError::ExtensionNotFound("lodge-runner".into());
        let (kernel, _launched) = kernel_with(dir.path(), Some(refusal.clone()));

        let err = kernel.spawn(guest_path(), Vec::new(), BTreeMap::new()).wait();
        assert_eq!(err, Err(refusal));
        assert!(kernel.all_processes().is_empty());
    }

    #[test]
    fn invalid_paths_are_rejected_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with(dir.path(), None);

        for path in [PathBuf::new(), dir.path().join("missing"), dir.path().to_path_buf()] {
            let err = kernel.spawn(&path, Vec::new(), BTreeMap::new()).wait();
            assert_eq!(err, Err(KernelError::InvalidPath(path)));
        }
        assert!(kernel.all_processes().is_empty());
        assert!(launched.try_recv().is_err());
    }

    #[test]
    fn channel_output_is_attributed_to_the_spawned_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with(dir.path(), None);
        let events = kernel.subscribe();
        let pid = kernel.spawn_now(SpawnOptions::new(guest_path())).unwrap();
        let (request, exits) = launched.recv_timeout(TIMEOUT).unwrap();

        let mut stream = UnixStream::connect(&request.channel).unwrap();
        writeln!(stream, "{}", request.request_id).unwrap();
        stream.write_all(b"hello").unwrap();

        assert_eq!(next(&events), KernelEvent::Spawned { pid });
        assert_eq!(next(&events), KernelEvent::Output { pid, bytes: b"hello".to_vec() });
        exits.exited(0);
        drop(stream);
        assert_eq!(next(&events), KernelEvent::Exited { pid, exit_code: 0 });
    }

    #[test]
    fn output_connected_after_a_fast_exit_still_precedes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with_grace(dir.path(), None, TIMEOUT);
        let events = kernel.subscribe();
        let pid = kernel.spawn_now(SpawnOptions::new(guest_path())).unwrap();
        let (request, exits) = launched.recv_timeout(TIMEOUT).unwrap();

        // The guest is gone before the channel has accepted its connection.
        exits.exited(0);
        assert_eq!(next(&events), KernelEvent::Spawned { pid });
        assert_eq!(kernel.try_wait(pid).unwrap(), None);

        let mut stream = UnixStream::connect(&request.channel).unwrap();
        writeln!(stream, "{}", request.request_id).unwrap();
        stream.write_all(b"last words").unwrap();
        drop(stream);

        let mut output = Vec::new();
        loop {
            match next(&events) {
                KernelEvent::Output { bytes, .. } => output.extend(bytes),
                event => {
                    assert_eq!(event, KernelEvent::Exited { pid, exit_code: 0 });
                    break;
                }
            }
        }
        assert_eq!(output, b"last words");
    }

    #[test]
    fn exit_is_published_after_the_grace_while_the_stream_stays_open() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with(dir.path(), None);
        let events = kernel.subscribe();
        let pid = kernel.spawn_now(SpawnOptions::new(guest_path())).unwrap();
        let (request, exits) = launched.recv_timeout(TIMEOUT).unwrap();

        let mut stream = UnixStream::connect(&request.channel).unwrap();
        writeln!(stream, "{}", request.request_id).unwrap();
        stream.write_all(b"before").unwrap();
        assert_eq!(next(&events), KernelEvent::Spawned { pid });
        assert_eq!(next(&events), KernelEvent::Output { pid, bytes: b"before".to_vec() });

        // A backgrounded descendant keeps the stream open past the exit.
        exits.exited(0);
        assert_eq!(next(&events), KernelEvent::Exited { pid, exit_code: 0 });

        stream.write_all(b"after").unwrap();
        drop(stream);
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn shutdown_racing_spawns_leaves_no_process_behind() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let (kernel, _launched) = kernel_with(dir.path(), None);
            let spawner = {
                let kernel = kernel.clone();
                std::thread::spawn(move || loop {
                    match kernel.spawn_now(SpawnOptions::new(guest_path())) {
                        Ok(_) => continue,
                        Err(err) => return err,
                    }
                })
            };
            std::thread::sleep(Duration::from_millis(2));
            kernel.shutdown();
            assert_eq!(spawner.join().unwrap(), KernelError::ShutDown);
            assert!(kernel.all_processes().is_empty());
        }
    }

    #[test]
    fn in_flight_request_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, _launched) = kernel_with(dir.path(), None);
        let id = RequestId::random();
        let options = SpawnOptions::new(guest_path()).request_id(id);

        let first = kernel.spawn_now(options.clone()).unwrap();
        assert_eq!(kernel.spawn_now(options), Err(KernelError::DuplicateRequest(id)));
        assert_eq!(kernel.process_for_request(id).unwrap().pid, first);
        assert_eq!(kernel.all_processes().len(), 1);
    }

    #[test]
    fn exits_for_forgotten_processes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, launched) = kernel_with(dir.path(), None);
        let pid = kernel.spawn_now(SpawnOptions::new(guest_path())).unwrap();
        let (_, exits) = launched.recv_timeout(TIMEOUT).unwrap();
        let events = kernel.subscribe();

        assert!(kernel.unregister(pid).is_some());
        exits.exited(0);
        assert!(!kernel.handle_exit(pid, 0));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn register_lookup_and_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, _launched) = kernel_with(dir.path(), None);
        let mut process = Process::new("/bin/sh");
        process.args = vec!["-c".into(), "true".into()];
        let request_id = process.request_id;

        let pid = kernel.register(process).unwrap();
        assert_eq!(kernel.process(pid).unwrap().args, ["-c", "true"]);
        assert_eq!(kernel.process_for_request(request_id).unwrap().pid, pid);

        let before = kernel.all_processes();
        assert!(kernel.unregister(pid + 1).is_none());
        assert_eq!(kernel.all_processes(), before);

        kernel.unregister(pid);
        assert_eq!(kernel.process(pid), Err(KernelError::ProcessNotFound(pid)));
        assert!(kernel.process_for_request(request_id).is_none());
    }

    #[test]
    fn output_observers_run_off_the_publishing_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, _launched) = kernel_with(dir.path(), None);
        let pid = kernel.register(Process::new("/bin/sh")).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        kernel
            .on_output(move |pid, bytes| {
                let thread = std::thread::current().name().map(str::to_owned);
                let _ = tx.send((pid, bytes.to_vec(), thread));
            })
            .unwrap();

        kernel
            .inner
            .table
            .lock()
            .output(pid, b"chunk".to_vec(), &kernel.inner.events);
        let (seen, bytes, thread) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!((seen, bytes.as_slice()), (pid, &b"chunk"[..]));
        assert_eq!(thread.as_deref(), Some("lodge-output"));
    }

    #[test]
    fn wait_blocks_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, _launched) = kernel_with(dir.path(), None);
        let pid = kernel.register(Process::new("/bin/sh")).unwrap();

        let exiter = kernel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            exiter.handle_exit(pid, 7)
        });
        assert_eq!(kernel.wait(pid).unwrap(), 7);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn shut_down_kernel_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (kernel, _launched) = kernel_with(dir.path(), None);
        let pid = kernel.spawn_now(SpawnOptions::new(guest_path())).unwrap();
        let events = kernel.subscribe();
        let socket = kernel.inner.channel.lock().as_ref().unwrap().path().to_path_buf();

        kernel.shutdown();
        kernel.shutdown();
        assert!(!socket.exists());
        assert!(kernel.all_processes().is_empty());
        assert!(events.recv_timeout(TIMEOUT).is_err());
        assert_eq!(
            kernel.spawn(guest_path(), Vec::new(), BTreeMap::new()).wait(),
            Err(KernelError::ShutDown)
        );
        assert_eq!(kernel.register(Process::new("/bin/sh")), Err(KernelError::ShutDown));
        assert_eq!(kernel.try_wait(pid), Err(KernelError::ShutDown));
        assert!(!kernel.handle_exit(pid, 0));
    }

    #[test]
    fn error_codes_are_stable() {
        let errors = [
            KernelError::ExtensionNotFound(String::new()),
            KernelError::ExtensionLoadFailed(String::new()),
            KernelError::SocketCreationFailed(String::new()),
            KernelError::SpawnFailed(String::new()),
            KernelError::InvalidPath(PathBuf::new()),
            KernelError::ProcessNotFound(1),
        ];
        let codes: Vec<_> = errors.iter().map(KernelError::code).collect();
        assert_eq!(codes, [1, 2, 3, 4, 5, 6]);
        assert_eq!(KernelError::InvalidPath(PathBuf::new()).errno(), libc::ENOENT);
        assert_eq!(KernelError::ProcessNotFound(1).errno(), libc::ESRCH);
    }
}

//! Worker execution contexts.
//!
//! A worker takes a [`SpawnRequest`], gets the guest running somewhere, and
//! later reports its exit through the [`ExitSink`] it was handed.

use super::process::{Pid, RequestId};
use super::{ExitSink, KernelError};
use crate::guest::SuppressGuard;
use crate::runner::{self, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, warn};

/// Exit code reported when the guest could not be waited for.
pub const EXIT_LOST: i32 = 255;

/// A descriptor edit the guest's creator asked for, applied in the new
/// process before it runs. Descriptor numbers are the creator's; a worker
/// process inherits them along with the descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Make `new_fd` a copy of `fd`.
    Dup2 { fd: i32, new_fd: i32 },
    Close { fd: i32 },
}

/// Everything a worker needs to run one guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub request_id: RequestId,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Output channel socket.
    pub channel: PathBuf,
    /// Load the guest into the worker instead of starting it as a process.
    #[serde(default)]
    pub in_process: bool,
    /// Applied in order before the guest starts.
    #[serde(default)]
    pub file_actions: Vec<FileAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Launched {
    pub physical_pid: Option<Pid>,
}

pub trait Worker: Send + Sync {
    /// Start the guest described by `request`. Returns once it is running;
    /// its exit is reported through `exits`.
    fn launch(&self, request: SpawnRequest, exits: ExitSink) -> Result<Launched, KernelError>;
}

/// Shell-style exit code for a finished process.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => EXIT_LOST,
    }
}

/// Runs each guest in its own `lodge-runner` process, the request going in
/// as JSON on its stdin.
#[derive(Clone, Debug)]
pub struct ProcessWorker {
    identifier: String,
    search_dirs: Vec<PathBuf>,
}

impl ProcessWorker {
    pub fn new(identifier: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            search_dirs,
        }
    }

    /// Locate the worker executable.
    pub fn resolve(&self) -> Result<PathBuf, KernelError> {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(&self.identifier))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| KernelError::ExtensionNotFound(self.identifier.clone()))
    }
}

impl Worker for ProcessWorker {
    fn launch(&self, request: SpawnRequest, exits: ExitSink) -> Result<Launched, KernelError> {
        let executable = self.resolve()?;
        let load_failed =
            |err: &dyn std::fmt::Display| KernelError::ExtensionLoadFailed(format!("{}: {err}", executable.display()));
        let payload = serde_json::to_vec(&request).map_err(|err| load_failed(&err))?;

        let mut child = {
            let _suppress = SuppressGuard::new();
            Command::new(&executable)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|err| load_failed(&err))?
        };
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload),
            None => Err(std::io::Error::other("no stdin pipe")),
        };
        if let Err(err) = written {
            let _ = child.kill();
            let _ = child.wait();
            return Err(load_failed(&err));
        }

        let physical_pid = child.id() as Pid;
        debug!("worker {physical_pid} started for {}", request.path.display());
        std::thread::Builder::new()
            .name("lodge-worker".into())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => exit_code(status),
                    Err(err) => {
                        warn!("lost worker {physical_pid}: {err}");
                        EXIT_LOST
                    }
                };
                exits.exited(code);
            })
            .map_err(|err| KernelError::SpawnFailed(err.to_string()))?;
        Ok(Launched {
            physical_pid: Some(physical_pid),
        })
    }
}

/// Runs each guest from a thread of the calling process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadWorker;

impl ThreadWorker {
    pub fn new() -> Self {
        Self
    }
}

impl Worker for ThreadWorker {
    fn launch(&self, request: SpawnRequest, exits: ExitSink) -> Result<Launched, KernelError> {
        let guest = runner::launch(&request).map_err(|err| match err {
            RunnerError::Connect { .. } => KernelError::SocketCreationFailed(err.to_string()),
            _ => KernelError::SpawnFailed(err.to_string()),
        })?;
        let physical_pid = guest.id().map(|id| id as Pid);
        std::thread::Builder::new()
            .name("lodge-guest".into())
            .spawn(move || exits.exited(guest.wait()))
            .map_err(|err| KernelError::SpawnFailed(err.to_string()))?;
        Ok(Launched { physical_pid })
    }
}

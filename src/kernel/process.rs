//! Virtual process records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// A process id, virtual or physical.
pub type Pid = libc::pid_t;

/// First virtual pid handed out. Above both Linux `pid_max` and Darwin
/// `PID_MAX`, so a virtual pid never names a real process.
pub const FIRST_VIRTUAL_PID: Pid = 0x40_0000;

/// Opaque token linking a spawn request to the worker's connection and exit
/// notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RequestId(u128);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed request id {0:?}")]
pub struct ParseRequestIdError(String);

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseRequestIdError(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseRequestIdError(s.to_string()))
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RequestId {
    type Error = ParseRequestIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
}

/// One virtual process as recorded by the kernel.
///
/// Callers only ever see copies; the kernel's table owns the original.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Process {
    /// Virtual pid; 0 until the table assigns one.
    pub pid: Pid,
    /// Pid of the OS process hosting the guest, when there is one.
    pub physical_pid: Option<Pid>,
    pub ppid: Pid,
    pub request_id: RequestId,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub start_time: SystemTime,
    pub state: ProcessState,
}

impl Process {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            pid: 0,
            physical_pid: None,
            ppid: crate::host_pid(),
            request_id: RequestId::random(),
            path: path.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
            start_time: SystemTime::now(),
            state: ProcessState::Running,
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.state, ProcessState::Exited(_))
    }

    /// Exit code, once exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ProcessState::Exited(code) => Some(code),
            ProcessState::Running => None,
        }
    }

    /// Mark exited; an exited process never changes again.
    pub(crate) fn mark_exited(&mut self, code: i32) -> bool {
        if self.has_exited() {
            return false;
        }
        self.state = ProcessState::Exited(code);
        true
    }
}

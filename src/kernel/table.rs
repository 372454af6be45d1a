//! The process table.
//!
//! The kernel keeps the table behind a single lock and passes its event bus
//! into every mutation, so events are published in table order. Entries stay
//! unannounced until the worker has accepted the request: output and exits
//! that race ahead of the launch are buffered and flushed right after the
//! spawned event.
//!
//! A spawned process's exit is held while its output stream is expected or
//! open, so output arrives before the exit. The kernel bounds the hold with
//! [`ProcessTable::expire_exit`].

use super::KernelError;
use super::event::{EventBus, KernelEvent};
use super::process::{FIRST_VIRTUAL_PID, Pid, Process, RequestId};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    /// No worker will connect.
    None,
    /// A worker holds the token and may connect at any moment.
    Expected,
    Open,
    Closed,
}

#[derive(Debug)]
struct Entry {
    process: Process,
    announced: bool,
    stream: Stream,
    pending_output: Vec<Vec<u8>>,
    pending_exit: Option<i32>,
}

#[derive(Debug)]
pub struct ProcessTable {
    entries: BTreeMap<Pid, Entry>,
    by_request: HashMap<RequestId, Pid>,
    next_pid: Pid,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_request: HashMap::new(),
            next_pid: FIRST_VIRTUAL_PID,
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = self.next_pid;
            self.next_pid = if pid == Pid::MAX {
                FIRST_VIRTUAL_PID
            } else {
                pid + 1
            };
            if !self.entries.contains_key(&pid) {
                return pid;
            }
        }
    }

    /// Add `process`, assigning a pid when its pid is 0. The entry stays
    /// unannounced until [`ProcessTable::announce`].
    pub fn insert(&mut self, mut process: Process) -> Result<Pid, KernelError> {
        if self.by_request.contains_key(&process.request_id) {
            return Err(KernelError::DuplicateRequest(process.request_id));
        }
        if process.pid == 0 {
            process.pid = self.allocate_pid();
        } else if self.entries.contains_key(&process.pid) {
            return Err(KernelError::PidInUse(process.pid));
        }
        let pid = process.pid;
        self.by_request.insert(process.request_id, pid);
        self.entries.insert(
            pid,
            Entry {
                process,
                announced: false,
                stream: Stream::None,
                pending_output: Vec::new(),
                pending_exit: None,
            },
        );
        trace!("table: inserted {pid}");
        Ok(pid)
    }

    /// Note that a worker was handed `pid`'s token and will connect an
    /// output stream.
    pub fn expect_stream(&mut self, pid: Pid) {
        if let Some(entry) = self.entries.get_mut(&pid) {
            if entry.stream == Stream::None {
                entry.stream = Stream::Expected;
            }
        }
    }

    /// Publish the spawned event for `pid`, then anything buffered behind it.
    /// Returns false when `pid` is no longer in the table.
    pub fn announce(&mut self, pid: Pid, physical_pid: Option<Pid>, events: &EventBus) -> bool {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return false;
        };
        if entry.announced {
            return true;
        }
        entry.process.physical_pid = physical_pid;
        entry.announced = true;
        events.publish(KernelEvent::Spawned { pid });
        for bytes in std::mem::take(&mut entry.pending_output) {
            events.publish(KernelEvent::Output { pid, bytes });
        }
        self.settle(pid, events);
        true
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let entry = self.entries.remove(&pid)?;
        self.by_request.remove(&entry.process.request_id);
        trace!("table: removed {pid}");
        Some(entry.process)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.entries.get(&pid).map(|entry| &entry.process)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn pid_for_request(&self, request_id: RequestId) -> Option<Pid> {
        self.by_request.get(&request_id).copied()
    }

    /// Copies of every process, by pid.
    pub fn processes(&self) -> Vec<Process> {
        self.entries.values().map(|entry| entry.process.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_request.clear();
    }

    /// Record the worker's output connection. A process gets one stream, and
    /// none once its exit is published; an exit that is only held does not
    /// refuse it.
    pub fn open_stream(&mut self, pid: Pid) -> bool {
        match self.entries.get_mut(&pid) {
            Some(entry)
                if matches!(entry.stream, Stream::None | Stream::Expected)
                    && !entry.process.has_exited() =>
            {
                entry.stream = Stream::Open;
                true
            }
            _ => false,
        }
    }

    pub fn output(&mut self, pid: Pid, bytes: Vec<u8>, events: &EventBus) {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        if entry.process.has_exited() {
            trace!("table: {} byte(s) for exited {pid} dropped", bytes.len());
            return;
        }
        if entry.announced {
            events.publish(KernelEvent::Output { pid, bytes });
        } else {
            entry.pending_output.push(bytes);
        }
    }

    pub fn close_stream(&mut self, pid: Pid, events: &EventBus) {
        if let Some(entry) = self.entries.get_mut(&pid) {
            entry.stream = Stream::Closed;
            self.settle(pid, events);
        }
    }

    /// Whether `pid` has an exit recorded but not yet published.
    pub fn exit_held(&self, pid: Pid) -> bool {
        self.entries
            .get(&pid)
            .is_some_and(|entry| entry.pending_exit.is_some())
    }

    /// Stop waiting for `pid`'s stream and publish its held exit, provided
    /// the entry still belongs to `request_id`. Output arriving later is
    /// dropped.
    pub fn expire_exit(&mut self, pid: Pid, request_id: RequestId, events: &EventBus) {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        if entry.process.request_id != request_id || entry.pending_exit.is_none() {
            return;
        }
        if matches!(entry.stream, Stream::Expected | Stream::Open) {
            debug!(
                "table: publishing exit of {pid} without waiting for its stream ({:?})",
                entry.stream
            );
            entry.stream = Stream::Closed;
        }
        self.settle(pid, events);
    }

    /// Record that `pid` exited. Returns false when the pid is unknown or its
    /// exit was already recorded.
    pub fn record_exit(&mut self, pid: Pid, exit_code: i32, events: &EventBus) -> bool {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return false;
        };
        if entry.process.has_exited() || entry.pending_exit.is_some() {
            debug!("table: duplicate exit for {pid} ignored");
            return false;
        }
        entry.pending_exit = Some(exit_code);
        self.settle(pid, events);
        true
    }

    /// Publish a recorded exit once the process is announced and its output
    /// stream is no longer open.
    fn settle(&mut self, pid: Pid, events: &EventBus) {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        if !entry.announced || matches!(entry.stream, Stream::Expected | Stream::Open) {
            return;
        }
        if let Some(exit_code) = entry.pending_exit.take() {
            if entry.process.mark_exited(exit_code) {
                events.publish(KernelEvent::Exited { pid, exit_code });
            }
        }
    }
}

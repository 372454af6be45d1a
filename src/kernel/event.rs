//! Kernel event bus.
//!
//! Every subscriber gets its own unbounded channel, so publishing never
//! blocks. The kernel publishes while holding the table lock, which is what
//! orders events for a pid: spawned, then output, then exited.

use super::process::Pid;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    Spawned { pid: Pid },
    Exited { pid: Pid, exit_code: i32 },
    Output { pid: Pid, bytes: Vec<u8> },
}

impl KernelEvent {
    pub fn pid(&self) -> Pid {
        match self {
            KernelEvent::Spawned { pid }
            | KernelEvent::Exited { pid, .. }
            | KernelEvent::Output { pid, .. } => *pid,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<KernelEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<KernelEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, forgetting dropped ones.
    pub fn publish(&self, event: KernelEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Disconnect every subscriber.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

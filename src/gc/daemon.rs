//! Concurrent GC daemon message loop (spec.md §5, §9 design note:
//! "a single long-running task with a condvar and a timed wait... Express
//! as a message loop: `{GcRequest | TrimTimeout | Shutdown}` selected via
//! a condvar-plus-predicate").
//!
//! `crossbeam::channel`'s `recv_timeout` plays the role of the
//! condvar-plus-predicate wait here: a pending message always takes
//! priority over the idle timeout, and the channel's internal wait queue
//! is exactly the "queue of work items multiple threads drain" shape this
//! crate uses `crossbeam` for elsewhere.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::util::constants::HEAP_TRIM_IDLE_TIME_MS;

/// A request sent to the daemon by an allocator or an explicit-GC caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMessage {
    GcRequest,
    Shutdown,
}

/// What the daemon loop should act on for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    GcRequest,
    TrimTimeout,
    Shutdown,
}

/// The sender half: cloned into every mutator thread and into
/// `HeapSource` so crossing `concurrentStartBytes` can wake the daemon
/// instead of merely logging it.
#[derive(Clone)]
pub struct GcDaemonHandle {
    tx: Sender<DaemonMessage>,
}

impl GcDaemonHandle {
    pub fn request_gc(&self) {
        let _ = self.tx.send(DaemonMessage::GcRequest);
    }

    pub fn request_shutdown(&self) {
        let _ = self.tx.send(DaemonMessage::Shutdown);
    }
}

/// The receiver half: owned by the daemon's own loop, not shared.
pub struct GcDaemonLoop {
    rx: Receiver<DaemonMessage>,
}

/// Creates a fresh daemon channel: one handle for callers, one loop for
/// the daemon thread.
pub fn channel() -> (GcDaemonHandle, GcDaemonLoop) {
    let (tx, rx) = channel::unbounded();
    (GcDaemonHandle { tx }, GcDaemonLoop { rx })
}

impl GcDaemonLoop {
    /// Blocks for at most `HEAP_TRIM_IDLE_TIME_MS`, returning the next
    /// event to act on.
    pub fn next_event(&self) -> DaemonEvent {
        match self.rx.recv_timeout(Duration::from_millis(HEAP_TRIM_IDLE_TIME_MS)) {
            Ok(DaemonMessage::GcRequest) => DaemonEvent::GcRequest,
            Ok(DaemonMessage::Shutdown) => DaemonEvent::Shutdown,
            Err(RecvTimeoutError::Timeout) => DaemonEvent::TrimTimeout,
            Err(RecvTimeoutError::Disconnected) => DaemonEvent::Shutdown,
        }
    }

    /// Runs `on_event` for every event until (and including) a `Shutdown`.
    pub fn run(self, mut on_event: impl FnMut(DaemonEvent)) {
        loop {
            let event = self.next_event();
            let shutting_down = event == DaemonEvent::Shutdown;
            on_event(event);
            if shutting_down {
                break;
            }
        }
    }
}

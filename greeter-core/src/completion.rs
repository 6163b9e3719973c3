//! Tagged completion events and the queue that multiplexes them.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_channel::{Receiver, Sender};

/// Opaque identity of an in-flight call.
///
/// The index addresses a slot in the call registry; the generation makes a
/// tag of a released call unusable even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTag {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// A tagged completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: CallTag,
    pub ok: bool,
}

impl Event {
    pub fn new(tag: CallTag, ok: bool) -> Self {
        Self { tag, ok }
    }
}

/// Multi-producer multi-consumer queue of completion events.
///
/// Each event is received by exactly one consumer.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    draining: Arc<AtomicBool>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Post an event. Events posted after shutdown are dropped.
    pub fn post(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!("completion queue is shut down, event for {} dropped", event.tag);
        }
    }

    /// Wait for the next event. `None` once the queue is shut down and empty.
    pub async fn next(&self) -> Option<Event> {
        self.rx.recv().await.ok()
    }

    /// Take an event if one is ready.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Mark the queue as draining. Consumers treat failed acceptances as
    /// cancellations from now on.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Close the queue. Pending events are still delivered, then consumers
    /// observe `None`.
    pub fn shutdown(&self) {
        self.tx.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

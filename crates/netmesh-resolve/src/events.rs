//! In-process activity signals keyed by event kind and target.
//!
//! Emission never blocks: when a listener's buffer is full the event is
//! dropped. Listeners only need to know that *some* activity happened.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::EventError;

/// Default number of buffered signals per listener.
pub const DEFAULT_EVENT_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A table lookup hit rows of the target job.
    TableQuery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub target: String,
}

pub struct EventBus {
    listeners: RwLock<HashMap<(EventKind, String), mpsc::Sender<Event>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Signal `target`'s listener, if any. Returns whether it was delivered.
    pub fn emit(&self, kind: EventKind, target: &str) -> bool {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = listeners.get(&(kind, target.to_string())) else {
            return false;
        };
        let delivered = tx
            .try_send(Event {
                kind,
                target: target.to_string(),
            })
            .is_ok();
        if !delivered {
            trace!(?kind, target, "event dropped");
        }
        delivered
    }

    /// Start listening for `kind` events about `target`.
    pub fn register(&self, kind: EventKind, target: &str) -> Result<mpsc::Receiver<Event>, EventError> {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let key = (kind, target.to_string());
        if listeners.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(EventError::AlreadyRegistered {
                kind,
                target: target.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        listeners.insert(key, tx);
        Ok(rx)
    }

    pub fn deregister(&self, kind: EventKind, target: &str) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, target.to_string()));
    }

    pub fn is_registered(&self, kind: EventKind, target: &str) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(kind, target.to_string()))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

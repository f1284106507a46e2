//! Error types for resolution, the message bus and the event bus.

use thiserror::Error;

pub type ResolveResult<T> = Result<T, ResolveError>;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("interest already registered for {0}")]
    InterestRegistered(String),

    #[error("table query already in progress for {0}")]
    InProgress(String),

    #[error("table query for {0} timed out")]
    Timeout(String),

    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("job name {0:?} is not of the form app.namespace.service.namespace")]
    MalformedJobName(String),

    #[error(transparent)]
    Event(#[from] EventError),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("message bus closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("{kind:?} events for {target} already have a listener")]
    AlreadyRegistered {
        kind: crate::events::EventKind,
        target: String,
    },
}

//! Error types for event publishing.

use thiserror::Error;

pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug, Error)]
pub enum EventError {
    /// Nobody is subscribed to the channel; the message was dropped.
    #[error("no subscribers for {0}")]
    NoSubscribers(&'static str),

    #[error("event bus closed")]
    Closed,
}

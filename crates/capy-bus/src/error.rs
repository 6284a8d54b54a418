//! Error types for capy-bus

use std::time::Duration;

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel already exists: {0}")]
    DuplicateChannel(String),

    #[error("Invalid channel '{name}': {reason}")]
    InvalidChannel { name: String, reason: String },

    #[error("Channel '{channel}' is full (waited {timeout:?})")]
    ChannelFull { channel: String, timeout: Duration },

    #[error("Bus is closed")]
    BusClosed,

    #[error("Subscriber '{subscriber}' failed on '{channel}' #{sequence}: {reason}")]
    SubscriberCallbackFailed {
        channel: String,
        sequence: u64,
        subscriber: String,
        reason: String,
    },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Dispatcher already taken for this bus")]
    DispatcherTaken,
}

impl BusError {
    /// Transient errors the publisher may retry.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, BusError::ChannelFull { .. })
    }
}

pub type BusResult<T> = Result<T, BusError>;

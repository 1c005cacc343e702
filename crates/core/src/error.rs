// Central Error Type for the Queue Engine

use crate::application::codec::CodecError;
use crate::domain::DomainError;
use crate::port::BrokerError;
use thiserror::Error;

/// Queue engine error type
#[derive(Error, Debug)]
pub enum QueueError {
    /// Cannot obtain a connection or channel, or the broker dropped it
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] BrokerError),

    #[error("Topology conflict on queue '{queue}': {source}")]
    TopologyConflict {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("Publish to queue '{queue}' failed: {source}")]
    Publish {
        queue: String,
        #[source]
        source: PublishFailure,
    },

    #[error("Queue '{0}' already has an active listener")]
    AlreadyRegistered(String),

    #[error("Validation error: {0}")]
    Validation(#[from] DomainError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Closing a consumer, channel or connection failed (logged, never returned)
    #[error("Failed to release {resource} of queue '{queue}': {source}")]
    ResourceRelease {
        queue: String,
        resource: &'static str,
        #[source]
        source: BrokerError,
    },
}

/// Cause of a publish failure
#[derive(Error, Debug)]
pub enum PublishFailure {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl QueueError {
    pub fn publish(queue: impl ToString, source: impl Into<PublishFailure>) -> Self {
        QueueError::Publish {
            queue: queue.to_string(),
            source: source.into(),
        }
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

// Domain Layer - Queue identity, options and message envelopes

pub mod error;
pub mod message;
pub mod queue;

// Re-exports
pub use error::DomainError;
pub use message::{
    ConsumerTag, Delivery, DeliveryMode, DeliveryTag, FieldValue, MessageProperties,
    QueueArguments,
};
pub use queue::{QueueName, QueueOptions, DEAD_LETTER_SUFFIX};

// Application Layer - Queue engine use cases

pub mod codec;
pub mod lifecycle;
pub mod queue_service;
pub mod session;
pub mod topology;

// Re-exports
pub use codec::{Codec, CodecError, JsonCodec};
pub use lifecycle::QueueLifecycle;
pub use queue_service::{DeliveryFailure, DeliveryOutcome, QueueHandler, QueueListener, QueueService};
pub use session::with_channel;

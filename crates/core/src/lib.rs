// Burrow Core - Queue Engine & Broker Ports
// NO broker client dependencies (hexagonal architecture)

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use application::{
    Codec, JsonCodec, QueueHandler, QueueLifecycle, QueueListener, QueueService,
};
pub use domain::{QueueName, QueueOptions};
pub use error::{QueueError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

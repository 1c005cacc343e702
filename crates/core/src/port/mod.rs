// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod consumer_flag;

// Re-exports
pub use broker::{BrokerError, Channel, Connection, ConnectionFactory, DeliveryConsumer};
pub use consumer_flag::{ConsumerFlag, EnvConsumerFlag, StaticConsumerFlag, ENABLE_CONSUMERS_ENV};

// Broker Port (Interface)
// Abstraction over an AMQP-style broker: named queues, per-message ack,
// dead-letter redirection

use crate::domain::{ConsumerTag, Delivery, DeliveryTag, MessageProperties, QueueArguments, QueueOptions};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Broker-level errors (adapter side)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    /// Re-declaration with different arguments, exclusive queue owned elsewhere
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Source of broker connections, shared read-only by every queue service
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    ///
    /// # Errors
    /// - BrokerError::ConnectionFailed on timeout, auth failure or unreachable host
    async fn new_connection(&self) -> Result<Box<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection and every channel opened on it
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Channel operations used by the queue engine
#[async_trait]
pub trait Channel: Send + Sync {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Subscribe `consumer` to `queue`, returning the broker-assigned consumer tag
    ///
    /// With `auto_ack = false` every delivery stays unacknowledged until
    /// `basic_ack`/`basic_nack` is called with its tag.
    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<ConsumerTag, BrokerError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError>;

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Push-based delivery callback handed to `basic_consume`
///
/// Invoked on a task owned by the broker adapter. Deliveries on one channel
/// are awaited one at a time, in dispatch order.
#[async_trait]
pub trait DeliveryConsumer: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery);

    /// The broker cancelled the subscription (queue deleted, etc.)
    async fn on_cancel(&self, consumer_tag: &str);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Recorded broker interaction
    #[derive(Debug, Clone, PartialEq)]
    pub enum BrokerCall {
        NewConnection,
        CreateChannel,
        QueueDeclare {
            queue: String,
            options: QueueOptions,
            arguments: QueueArguments,
        },
        Publish {
            exchange: String,
            routing_key: String,
            properties: MessageProperties,
            body: Vec<u8>,
        },
        Consume {
            queue: String,
            auto_ack: bool,
        },
        Ack {
            delivery_tag: DeliveryTag,
            multiple: bool,
        },
        Nack {
            delivery_tag: DeliveryTag,
            multiple: bool,
            requeue: bool,
        },
        Cancel {
            consumer_tag: ConsumerTag,
        },
        CloseChannel,
        CloseConnection,
    }

    /// Operation a failure can be injected into
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum FailPoint {
        NewConnection,
        CreateChannel,
        QueueDeclare,
        Publish,
        Consume,
        Ack,
        Nack,
        Cancel,
        CloseChannel,
        CloseConnection,
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<BrokerCall>,
        failures: HashMap<FailPoint, BrokerError>,
        consumers: Vec<(ConsumerTag, Arc<dyn DeliveryConsumer>)>,
        /// Every consumer ever subscribed, cancelled or not
        subscribed: Vec<(ConsumerTag, Arc<dyn DeliveryConsumer>)>,
        next_consumer: u64,
        next_delivery_tag: DeliveryTag,
    }

    /// Recording broker fake
    ///
    /// Every call is recorded; injected failures stay active until cleared.
    /// Deliveries are pushed manually with `deliver`.
    #[derive(Clone, Default)]
    pub struct MockBroker {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail(&self, point: FailPoint, error: BrokerError) {
            self.state.lock().unwrap().failures.insert(point, error);
        }

        pub fn clear_failure(&self, point: FailPoint) {
            self.state.lock().unwrap().failures.remove(&point);
        }

        pub fn calls(&self) -> Vec<BrokerCall> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn count(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|call| predicate(call))
                .count()
        }

        pub fn active_consumers(&self) -> usize {
            self.state.lock().unwrap().consumers.len()
        }

        /// Push `body` to the most recent active consumer and wait for the callback
        ///
        /// Returns the delivery tag used, or None if nobody is subscribed.
        pub async fn deliver(&self, body: impl Into<Vec<u8>>) -> Option<DeliveryTag> {
            let target = self.state.lock().unwrap().consumers.last().cloned()?;
            Some(self.push(target, body.into()).await)
        }

        /// Push `body` to the most recently subscribed consumer even if it was
        /// cancelled, like a delivery dispatched just before the cancel
        pub async fn deliver_late(&self, body: impl Into<Vec<u8>>) -> Option<DeliveryTag> {
            let target = self.state.lock().unwrap().subscribed.last().cloned()?;
            Some(self.push(target, body.into()).await)
        }

        async fn push(
            &self,
            (consumer_tag, consumer): (ConsumerTag, Arc<dyn DeliveryConsumer>),
            body: Vec<u8>,
        ) -> DeliveryTag {
            let delivery_tag = {
                let mut state = self.state.lock().unwrap();
                state.next_delivery_tag += 1;
                state.next_delivery_tag
            };

            consumer
                .on_delivery(Delivery {
                    delivery_tag,
                    consumer_tag,
                    routing_key: String::new(),
                    redelivered: false,
                    properties: MessageProperties::default(),
                    body,
                })
                .await;

            delivery_tag
        }

        fn record(&self, call: BrokerCall, point: FailPoint) -> Result<(), BrokerError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            match state.failures.get(&point) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockBroker {
        async fn new_connection(&self) -> Result<Box<dyn Connection>, BrokerError> {
            self.record(BrokerCall::NewConnection, FailPoint::NewConnection)?;
            Ok(Box::new(MockConnection {
                broker: self.clone(),
            }))
        }
    }

    pub struct MockConnection {
        broker: MockBroker,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
            self.broker
                .record(BrokerCall::CreateChannel, FailPoint::CreateChannel)?;
            Ok(Arc::new(MockChannel {
                broker: self.broker.clone(),
            }))
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.broker
                .record(BrokerCall::CloseConnection, FailPoint::CloseConnection)
        }
    }

    pub struct MockChannel {
        broker: MockBroker,
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn queue_declare(
            &self,
            queue: &str,
            options: QueueOptions,
            arguments: QueueArguments,
        ) -> Result<(), BrokerError> {
            self.broker.record(
                BrokerCall::QueueDeclare {
                    queue: queue.to_string(),
                    options,
                    arguments,
                },
                FailPoint::QueueDeclare,
            )
        }

        async fn basic_publish(
            &self,
            exchange: &str,
            routing_key: &str,
            properties: MessageProperties,
            body: Vec<u8>,
        ) -> Result<(), BrokerError> {
            self.broker.record(
                BrokerCall::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties,
                    body,
                },
                FailPoint::Publish,
            )
        }

        async fn basic_consume(
            &self,
            queue: &str,
            auto_ack: bool,
            consumer: Arc<dyn DeliveryConsumer>,
        ) -> Result<ConsumerTag, BrokerError> {
            self.broker.record(
                BrokerCall::Consume {
                    queue: queue.to_string(),
                    auto_ack,
                },
                FailPoint::Consume,
            )?;

            let mut state = self.broker.state.lock().unwrap();
            state.next_consumer += 1;
            let tag = format!("mock-ctag-{}", state.next_consumer);
            state.consumers.push((tag.clone(), consumer.clone()));
            state.subscribed.push((tag.clone(), consumer));
            Ok(tag)
        }

        async fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
            self.broker.record(
                BrokerCall::Ack {
                    delivery_tag,
                    multiple,
                },
                FailPoint::Ack,
            )
        }

        async fn basic_nack(
            &self,
            delivery_tag: DeliveryTag,
            multiple: bool,
            requeue: bool,
        ) -> Result<(), BrokerError> {
            self.broker.record(
                BrokerCall::Nack {
                    delivery_tag,
                    multiple,
                    requeue,
                },
                FailPoint::Nack,
            )
        }

        async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
            self.broker.record(
                BrokerCall::Cancel {
                    consumer_tag: consumer_tag.to_string(),
                },
                FailPoint::Cancel,
            )?;

            self.broker
                .state
                .lock()
                .unwrap()
                .consumers
                .retain(|(tag, _)| tag != consumer_tag);
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.broker
                .record(BrokerCall::CloseChannel, FailPoint::CloseChannel)
        }
    }
}

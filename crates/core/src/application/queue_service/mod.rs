// Queue Service - typed send/receive over one named queue

pub mod constants;
mod delivery;
mod registration;

pub use delivery::{DeliveryFailure, DeliveryOutcome};

use crate::application::codec::{Codec, JsonCodec};
use crate::application::session::{close_channel, close_connection, with_channel};
use crate::application::topology::{self, DEFAULT_EXCHANGE};
use crate::domain::{DeliveryMode, MessageProperties, QueueName, QueueOptions};
use crate::error::{QueueError, Result};
use crate::port::{Channel, ConnectionFactory, DeliveryConsumer};
use async_trait::async_trait;
use constants::DEFAULT_DRAIN_TIMEOUT;
use delivery::{InFlight, QueueConsumer};
use registration::Registration;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Business handler invoked for every successfully decoded message
///
/// Returning `Err` (or panicking) nacks the delivery without requeue, so the
/// broker moves it to the dead-letter queue. Broker mechanics are not the
/// handler's concern.
#[async_trait]
pub trait QueueHandler<T>: Send + Sync + 'static {
    async fn receive(&self, message: T) -> anyhow::Result<()>;
}

/// Lifecycle surface shared by every queue service, whatever its payload type
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueListener: Send + Sync {
    /// Queue name, for logging
    fn name(&self) -> String;

    /// Start consuming
    ///
    /// # Errors
    /// - QueueError::AlreadyRegistered if a registration is already active
    /// - QueueError::Connectivity / QueueError::TopologyConflict on broker failure
    async fn register_queue_listener(&self) -> Result<()>;

    /// Stop consuming; a no-op when nothing is registered. Never fails.
    async fn unregister_queue_listener(&self);
}

/// Typed queue service
///
/// Owns a shared connection factory, a codec, the queue name and options,
/// and the user's handler. At most one long-lived consumer registration is
/// active at a time; register and unregister are serialized by the
/// registration slot lock.
pub struct QueueService<T, H, C = JsonCodec> {
    factory: Arc<dyn ConnectionFactory>,
    codec: Arc<C>,
    queue: QueueName,
    options: QueueOptions,
    handler: Arc<H>,
    drain_timeout: Duration,
    registration: Mutex<Option<Registration>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> QueueService<T, H, JsonCodec>
where
    T: Send + 'static,
    H: QueueHandler<T>,
    JsonCodec: Codec<T>,
{
    /// Queue service with default options and the JSON codec
    pub fn new(factory: Arc<dyn ConnectionFactory>, queue: QueueName, handler: H) -> Self {
        Self::with_options(factory, queue, QueueOptions::default(), handler)
    }

    pub fn with_options(
        factory: Arc<dyn ConnectionFactory>,
        queue: QueueName,
        options: QueueOptions,
        handler: H,
    ) -> Self {
        Self {
            factory,
            codec: Arc::new(JsonCodec),
            queue,
            options,
            handler: Arc::new(handler),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            registration: Mutex::new(None),
            _payload: PhantomData,
        }
    }
}

impl<T, H, C> QueueService<T, H, C>
where
    T: Send + 'static,
    H: QueueHandler<T>,
    C: Codec<T> + 'static,
{
    /// Replace the payload codec
    pub fn with_codec<C2>(self, codec: C2) -> QueueService<T, H, C2>
    where
        C2: Codec<T> + 'static,
    {
        QueueService {
            factory: self.factory,
            codec: Arc::new(codec),
            queue: self.queue,
            options: self.options,
            handler: self.handler,
            drain_timeout: self.drain_timeout,
            registration: self.registration,
            _payload: PhantomData,
        }
    }

    /// Bound on how long unregister waits for an in-flight delivery
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn is_registered(&self) -> bool {
        self.registration.lock().await.is_some()
    }

    /// Publish `message` to this queue
    ///
    /// Opens a transient channel, declares the topology, and publishes to the
    /// default exchange. Fails fast; retrying is up to the caller.
    ///
    /// # Errors
    /// - QueueError::Publish if encoding or publishing fails
    /// - QueueError::Connectivity if no connection/channel can be opened
    /// - QueueError::TopologyConflict if the queue exists with other options
    pub async fn send(&self, message: &T) -> Result<()> {
        let body = self
            .codec
            .encode(message)
            .map_err(|e| QueueError::publish(&self.queue, e))?;
        let size = body.len();

        let delivery_mode = if self.options.durable {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        };
        let properties = MessageProperties::default()
            .with_content_type(self.codec.content_type())
            .with_delivery_mode(delivery_mode);

        let queue = &self.queue;
        let options = self.options;
        with_channel(self.factory.as_ref(), queue, |channel| async move {
            topology::declare(channel.as_ref(), queue, options).await?;
            channel
                .basic_publish(DEFAULT_EXCHANGE, queue.as_str(), properties, body)
                .await
                .map_err(|e| QueueError::publish(queue, e))
        })
        .await?;

        debug!(queue = %self.queue, bytes = size, "Sent message");
        Ok(())
    }

    /// Handle one message directly, bypassing the broker
    pub async fn receive(&self, message: T) -> anyhow::Result<()> {
        self.handler.receive(message).await
    }

    /// Open a long-lived connection/channel and start consuming
    ///
    /// Deliveries are acked after the handler succeeds and nacked without
    /// requeue when decoding or handling fails. Resources opened before a
    /// failure are released before the error is returned.
    pub async fn register_queue_listener(&self) -> Result<()> {
        let mut slot = self.registration.lock().await;
        if slot.is_some() {
            return Err(QueueError::AlreadyRegistered(self.queue.to_string()));
        }

        let connection = self.factory.new_connection().await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(connection.as_ref(), &self.queue).await;
                return Err(QueueError::Connectivity(e));
            }
        };

        let in_flight = Arc::new(InFlight::default());
        let consumer: Arc<dyn DeliveryConsumer> = Arc::new(QueueConsumer::new(
            self.queue.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.handler),
            Arc::clone(&channel),
            Arc::clone(&in_flight),
        ));

        match self.subscribe(channel.as_ref(), consumer).await {
            Ok(consumer_tag) => {
                info!(queue = %self.queue, consumer_tag = %consumer_tag, "Queue listener registered");
                *slot = Some(Registration {
                    consumer_tag,
                    channel,
                    connection,
                    in_flight,
                });
                Ok(())
            }
            Err(e) => {
                close_channel(channel.as_ref(), &self.queue).await;
                close_connection(connection.as_ref(), &self.queue).await;
                Err(e)
            }
        }
    }

    /// Cancel the active registration, if any, and release its resources
    pub async fn unregister_queue_listener(&self) {
        let mut slot = self.registration.lock().await;
        match slot.take() {
            Some(registration) => registration.release(&self.queue, self.drain_timeout).await,
            None => debug!(queue = %self.queue, "No active listener to unregister"),
        }
    }

    async fn subscribe(
        &self,
        channel: &dyn Channel,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<String> {
        topology::declare(channel, &self.queue, self.options).await?;
        let consumer_tag = channel
            .basic_consume(self.queue.as_str(), false, consumer)
            .await?;
        Ok(consumer_tag)
    }
}

#[async_trait]
impl<T, H, C> QueueListener for QueueService<T, H, C>
where
    T: Send + 'static,
    H: QueueHandler<T>,
    C: Codec<T> + 'static,
{
    fn name(&self) -> String {
        self.queue.to_string()
    }

    async fn register_queue_listener(&self) -> Result<()> {
        QueueService::register_queue_listener(self).await
    }

    async fn unregister_queue_listener(&self) {
        QueueService::unregister_queue_listener(self).await
    }
}

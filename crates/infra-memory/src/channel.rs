// MemoryChannel - Channel port: declare, publish, consume, settle

use crate::broker::BrokerState;
use crate::dispatch::run_consumer;
use crate::faults::Operation;
use crate::lock;
use crate::queue::{Declaration, MemoryQueue, StoredMessage, Subscriber};
use crate::shutdown::cancel_channel;
use async_trait::async_trait;
use burrow_core::domain::{
    ConsumerTag, DeliveryTag, MessageProperties, QueueArguments, QueueOptions,
};
use burrow_core::port::{BrokerError, Channel, DeliveryConsumer};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// A delivery waiting for ack/nack
struct Unacked {
    queue: Arc<MemoryQueue>,
    message: StoredMessage,
}

/// Channel state shared with its consumers' dispatch tasks
pub(crate) struct ChannelInner {
    id: u64,
    connection_id: u64,
    broker: Arc<BrokerState>,
    closed: AtomicBool,
    next_delivery_tag: AtomicU64,
    unacked: Mutex<BTreeMap<DeliveryTag, Unacked>>,
    consumers: Mutex<HashMap<ConsumerTag, Arc<MemoryQueue>>>,
    /// Held while a delivery callback runs; one delivery at a time per channel
    dispatch: AsyncMutex<()>,
}

impl ChannelInner {
    pub(crate) fn new(id: u64, connection_id: u64, broker: Arc<BrokerState>) -> Self {
        Self {
            id,
            connection_id,
            broker,
            closed: AtomicBool::new(false),
            next_delivery_tag: AtomicU64::new(0),
            unacked: Mutex::new(BTreeMap::new()),
            consumers: Mutex::new(HashMap::new()),
            dispatch: AsyncMutex::new(()),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn dispatch_turn(&self) -> AsyncMutexGuard<'_, ()> {
        self.dispatch.lock().await
    }

    /// Assign a delivery tag; without auto-ack the message stays unacked
    ///
    /// Returns `None` once the channel is closed.
    pub(crate) fn track(
        &self,
        queue: &Arc<MemoryQueue>,
        message: &StoredMessage,
        auto_ack: bool,
    ) -> Option<DeliveryTag> {
        let mut unacked = lock(&self.unacked);
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if !auto_ack {
            unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.clone(),
                    message: message.clone(),
                },
            );
        }
        Some(delivery_tag)
    }

    fn take_unacked(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<Vec<Unacked>, BrokerError> {
        let mut unacked = lock(&self.unacked);
        if !multiple {
            return unacked
                .remove(&delivery_tag)
                .map(|entry| vec![entry])
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag));
        }

        // multiple = true settles every outstanding tag up to and including this one
        let rest = match delivery_tag.checked_add(1) {
            Some(next) => unacked.split_off(&next),
            None => BTreeMap::new(),
        };
        let taken = std::mem::replace(&mut *unacked, rest);
        if taken.is_empty() {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }
        Ok(taken.into_values().collect())
    }

    /// Close the channel: cancel consumers, requeue unacked deliveries
    ///
    /// Returns false if it was already closed.
    pub(crate) fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let consumers: Vec<_> = lock(&self.consumers).drain().collect();
        for (consumer_tag, queue) in consumers {
            if queue.unsubscribe(&consumer_tag) {
                self.broker.remove_queue(&queue);
            }
        }

        let unacked = std::mem::take(&mut *lock(&self.unacked));
        let requeued = unacked.len();
        requeue(unacked.into_values().collect());

        self.broker.channel_closed();
        debug!(channel = self.id, requeued = requeued, "Channel closed");
        true
    }
}

/// Put unacked messages back on their queues in delivery order
fn requeue(entries: Vec<Unacked>) {
    let mut grouped: Vec<(Arc<MemoryQueue>, Vec<StoredMessage>)> = Vec::new();
    for Unacked { queue, message } in entries {
        match grouped.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &queue)) {
            Some((_, messages)) => messages.push(message),
            None => grouped.push((queue, vec![message])),
        }
    }
    for (queue, messages) in grouped {
        queue.requeue_front(messages);
    }
}

pub(crate) struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

impl MemoryChannel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::QueueDeclare)?;
        if queue.is_empty() {
            return Err(BrokerError::Protocol(
                "server-named queues are not supported".to_string(),
            ));
        }

        self.inner.broker.declare(
            queue,
            Declaration { options, arguments },
            self.inner.connection_id,
        )
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::Publish)?;
        if !exchange.is_empty() {
            return Err(BrokerError::NotFound(format!("exchange '{}'", exchange)));
        }

        self.inner.broker.publish(
            routing_key,
            StoredMessage {
                routing_key: routing_key.to_string(),
                properties,
                body,
                redelivered: false,
            },
        )
    }

    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<ConsumerTag, BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::Consume)?;

        let target = self
            .inner
            .broker
            .queue(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", queue)))?;
        if !target.accessible_from(self.inner.connection_id) {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' is locked by an exclusive connection",
                queue
            )));
        }

        let consumer_tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (cancel, token) = cancel_channel();
        {
            let mut consumers = lock(&self.inner.consumers);
            self.inner.ensure_open()?;
            target.subscribe(
                consumer_tag.clone(),
                Subscriber {
                    cancel,
                    consumer: consumer.clone(),
                },
            );
            consumers.insert(consumer_tag.clone(), target.clone());
        }

        tokio::spawn(run_consumer(
            self.inner.clone(),
            target,
            consumer_tag.clone(),
            consumer,
            auto_ack,
            token,
        ));
        debug!(channel = self.inner.id, queue = queue, consumer_tag = %consumer_tag, "Consumer started");
        Ok(consumer_tag)
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::Ack)?;
        self.inner.take_unacked(delivery_tag, multiple)?;
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue_messages: bool,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::Nack)?;
        let entries = self.inner.take_unacked(delivery_tag, multiple)?;

        if requeue_messages {
            requeue(entries);
        } else {
            for Unacked { queue, message } in entries {
                self.inner.broker.dead_letter(&queue, message);
            }
        }
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::Cancel)?;

        let queue = lock(&self.inner.consumers)
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer tag '{}'", consumer_tag)))?;
        if queue.unsubscribe(consumer_tag) {
            self.inner.broker.remove_queue(&queue);
        }
        debug!(channel = self.inner.id, consumer_tag = consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.broker.check(Operation::CloseChannel)?;
        if self.inner.shutdown() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

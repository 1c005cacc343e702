// MemoryBroker - process-local ConnectionFactory with inspection and fault injection

use crate::connection::MemoryConnection;
use crate::faults::{FaultPlan, Operation};
use crate::lock;
use crate::queue::{
    Declaration, MemoryQueue, StoredMessage, FIRST_DEATH_QUEUE_HEADER, FIRST_DEATH_REASON_HEADER,
};
use async_trait::async_trait;
use burrow_core::domain::{FieldValue, QueueArguments, QueueOptions};
use burrow_core::port::{BrokerError, Connection, ConnectionFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// State shared by the broker handle and every connection/channel it opened
#[derive(Default)]
pub(crate) struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    faults: Mutex<FaultPlan>,
    next_connection_id: AtomicU64,
    open_connections: AtomicUsize,
    open_channels: AtomicUsize,
}

impl BrokerState {
    /// Consume an injected fault for `operation`, if one is pending
    pub(crate) fn check(&self, operation: Operation) -> Result<(), BrokerError> {
        lock(&self.faults).check(operation)
    }

    pub(crate) fn declare(
        &self,
        name: &str,
        declaration: Declaration,
        connection_id: u64,
    ) -> Result<(), BrokerError> {
        let mut queues = lock(&self.queues);
        if let Some(existing) = queues.get(name) {
            if !existing.accessible_from(connection_id) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' is locked by an exclusive connection",
                    name
                )));
            }
            if existing.declaration() != &declaration {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(());
        }

        queues.insert(
            name.to_string(),
            Arc::new(MemoryQueue::new(name, declaration, connection_id)),
        );
        debug!(queue = name, "Queue declared");
        Ok(())
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    /// Default-exchange routing: the routing key is the queue name
    pub(crate) fn publish(&self, routing_key: &str, message: StoredMessage) -> Result<(), BrokerError> {
        let queue = self
            .queue(routing_key)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", routing_key)))?;
        queue.push_back(message);
        Ok(())
    }

    /// Route a rejected message to the source queue's dead-letter target
    pub(crate) fn dead_letter(&self, source: &MemoryQueue, mut message: StoredMessage) {
        let Some(target) = source.dead_letter_target() else {
            debug!(queue = source.name(), "Rejected message dropped, no dead-letter target");
            return;
        };

        let Some(dead_letter_queue) = self.queue(target) else {
            warn!(
                queue = source.name(),
                dead_letter_queue = target,
                "Dead-letter queue missing, rejected message dropped"
            );
            return;
        };

        let headers = &mut message.properties.headers;
        headers
            .entry(FIRST_DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| FieldValue::from(source.name()));
        headers
            .entry(FIRST_DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| FieldValue::from("rejected"));
        message.routing_key = target.to_string();
        message.redelivered = false;

        dead_letter_queue.push_back(message);
        debug!(queue = source.name(), dead_letter_queue = target, "Message dead-lettered");
    }

    /// Remove `queue` if it is still the one registered under its name
    pub(crate) fn remove_queue(&self, queue: &Arc<MemoryQueue>) {
        let mut queues = lock(&self.queues);
        let current = queues.get(queue.name()).is_some_and(|known| Arc::ptr_eq(known, queue));
        if current {
            queues.remove(queue.name());
            queue.mark_deleted();
            let purged = queue.purge();
            debug!(queue = queue.name(), purged = purged, "Queue removed");
        }
    }

    /// Drop the exclusive queues owned by a closing connection
    pub(crate) fn remove_exclusive(&self, connection_id: u64) {
        let owned: Vec<Arc<MemoryQueue>> = lock(&self.queues)
            .values()
            .filter(|queue| queue.owner() == Some(connection_id))
            .cloned()
            .collect();
        for queue in owned {
            self.remove_queue(&queue);
        }
    }

    pub(crate) fn channel_opened(&self) {
        self.open_channels.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn channel_closed(&self) {
        self.open_channels.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-local broker
///
/// Clones share the same queues. Implements `ConnectionFactory`, so it can be
/// handed to any `QueueService`.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: Operation, times: u32) {
        lock(&self.state.faults).fail_next(operation, times);
    }

    pub fn clear_faults(&self) {
        lock(&self.state.faults).clear();
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queue(name).is_some()
    }

    /// Number of ready (not yet delivered) messages
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.queue(name).map(|queue| queue.depth())
    }

    /// Bodies of the ready messages, head first
    pub fn messages(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .queue(name)
            .map(|queue| queue.bodies())
            .unwrap_or_default()
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state
            .queue(name)
            .map(|queue| queue.declaration().options)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.state
            .queue(name)
            .map(|queue| queue.declaration().arguments.clone())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queue(name)
            .map_or(0, |queue| queue.consumer_count())
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    /// Delete a queue, notifying its consumers through `on_cancel`
    ///
    /// Returns the number of ready messages dropped, or `None` if the queue
    /// does not exist.
    pub async fn delete_queue(&self, name: &str) -> Option<usize> {
        let queue = lock(&self.state.queues).remove(name)?;
        queue.mark_deleted();
        let purged = queue.purge();

        for (consumer_tag, consumer) in queue.cancel_all() {
            consumer.on_cancel(&consumer_tag).await;
        }
        info!(queue = name, purged = purged, "Queue deleted");
        Some(purged)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn new_connection(&self) -> Result<Box<dyn Connection>, BrokerError> {
        self.state.check(Operation::NewConnection)?;

        let id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "Connection opened");

        Ok(Box::new(MemoryConnection::new(id, self.state.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG};
    use burrow_core::domain::{Delivery, MessageProperties};
    use burrow_core::port::{Channel, DeliveryConsumer};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    /// Forwards deliveries and cancellations to the test body
    struct Forwarder {
        deliveries: mpsc::UnboundedSender<Delivery>,
        cancels: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl DeliveryConsumer for Forwarder {
        async fn on_delivery(&self, delivery: Delivery) {
            let _ = self.deliveries.send(delivery);
        }

        async fn on_cancel(&self, consumer_tag: &str) {
            let _ = self.cancels.send(consumer_tag.to_string());
        }
    }

    fn forwarder() -> (
        Arc<Forwarder>,
        mpsc::UnboundedReceiver<Delivery>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();
        let (cancels, cancel_rx) = mpsc::unbounded_channel();
        (Arc::new(Forwarder { deliveries, cancels }), delivery_rx, cancel_rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery expected")
            .expect("channel open")
    }

    fn dead_letter_args(target: &str) -> QueueArguments {
        let mut arguments = QueueArguments::new();
        arguments.insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), FieldValue::from(""));
        arguments.insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), FieldValue::from(target));
        arguments
    }

    async fn open(broker: &MemoryBroker) -> (Box<dyn Connection>, Arc<dyn Channel>) {
        let connection = assert_ok!(broker.new_connection().await);
        let channel = assert_ok!(connection.create_channel().await);
        (connection, channel)
    }

    #[tokio::test]
    async fn test_declare_is_idempotent_and_detects_conflicts() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;

        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();

        let err = channel
            .queue_declare("orders", QueueOptions::default().durable(true), QueueArguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
        assert_eq!(broker.queue_options("orders"), Some(QueueOptions::default()));
    }

    #[tokio::test]
    async fn test_publish_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();

        channel
            .basic_publish("", "orders", MessageProperties::default(), b"one".to_vec())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("orders"), Some(1));
        assert_eq!(broker.messages("orders"), vec![b"one".to_vec()]);

        let missing = channel
            .basic_publish("", "nowhere", MessageProperties::default(), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(missing, BrokerError::NotFound(_)));

        let exchange = channel
            .basic_publish("events", "orders", MessageProperties::default(), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(exchange, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_ack_removes_message() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", MessageProperties::default(), b"one".to_vec())
            .await
            .unwrap();

        let (consumer, mut deliveries, _cancels) = forwarder();
        let tag = assert_ok!(channel.basic_consume("orders", false, consumer).await);
        assert!(tag.starts_with("amq.ctag-"));
        assert_eq!(broker.consumer_count("orders"), 1);

        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.body, b"one".to_vec());
        assert_eq!(delivery.consumer_tag, tag);
        assert!(!delivery.redelivered);

        assert_ok!(channel.basic_ack(delivery.delivery_tag, false).await);
        assert_eq!(broker.queue_depth("orders"), Some(0));

        let twice = assert_err!(channel.basic_ack(delivery.delivery_tag, false).await);
        assert_eq!(twice, BrokerError::UnknownDeliveryTag(delivery.delivery_tag));
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders_dlq", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        channel
            .queue_declare("orders", QueueOptions::default(), dead_letter_args("orders_dlq"))
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", MessageProperties::default(), b"bad".to_vec())
            .await
            .unwrap();

        let (consumer, mut deliveries, _cancels) = forwarder();
        assert_ok!(channel.basic_consume("orders", false, consumer).await);
        let delivery = next(&mut deliveries).await;
        assert_ok!(channel.basic_nack(delivery.delivery_tag, false, false).await);

        assert_eq!(broker.queue_depth("orders"), Some(0));
        assert_eq!(broker.messages("orders_dlq"), vec![b"bad".to_vec()]);

        let (consumer, mut dead, _cancels) = forwarder();
        assert_ok!(channel.basic_consume("orders_dlq", false, consumer).await);
        let dead_lettered = next(&mut dead).await;
        let headers = &dead_lettered.properties.headers;
        assert_eq!(dead_lettered.routing_key, "orders_dlq");
        assert!(!dead_lettered.redelivered);
        assert_eq!(headers.get(FIRST_DEATH_QUEUE_HEADER), Some(&FieldValue::from("orders")));
        assert_eq!(headers.get(FIRST_DEATH_REASON_HEADER), Some(&FieldValue::from("rejected")));
    }

    #[tokio::test]
    async fn test_multiple_ack_settles_earlier_tags() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        for body in [b"one", b"two"] {
            channel
                .basic_publish("", "orders", MessageProperties::default(), body.to_vec())
                .await
                .unwrap();
        }

        let (consumer, mut deliveries, _cancels) = forwarder();
        assert_ok!(channel.basic_consume("orders", false, consumer).await);
        let first = next(&mut deliveries).await;
        let second = next(&mut deliveries).await;
        assert!(first.delivery_tag < second.delivery_tag);

        assert_ok!(channel.basic_ack(second.delivery_tag, true).await);
        let settled = assert_err!(channel.basic_ack(first.delivery_tag, false).await);
        assert_eq!(settled, BrokerError::UnknownDeliveryTag(first.delivery_tag));

        // Nothing left unacked, so closing requeues nothing
        assert_ok!(channel.close().await);
        assert_eq!(broker.queue_depth("orders"), Some(0));
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", MessageProperties::default(), b"again".to_vec())
            .await
            .unwrap();

        let (consumer, mut deliveries, _cancels) = forwarder();
        assert_ok!(channel.basic_consume("orders", false, consumer).await);

        let first = next(&mut deliveries).await;
        assert_ok!(channel.basic_nack(first.delivery_tag, false, true).await);

        let second = next(&mut deliveries).await;
        assert_eq!(second.body, b"again".to_vec());
        assert!(second.redelivered);
        assert_ne!(first.delivery_tag, second.delivery_tag);
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked_and_cancels_consumers() {
        let broker = MemoryBroker::new();
        let (connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", MessageProperties::default(), b"held".to_vec())
            .await
            .unwrap();

        let (consumer, mut deliveries, _cancels) = forwarder();
        assert_ok!(channel.basic_consume("orders", false, consumer).await);
        next(&mut deliveries).await;
        assert_eq!(broker.queue_depth("orders"), Some(0));

        assert_ok!(channel.close().await);
        assert_eq!(broker.queue_depth("orders"), Some(1));
        assert_eq!(broker.consumer_count("orders"), 0);
        assert_eq!(broker.open_channels(), 0);

        let closed = assert_err!(channel.basic_ack(1, false).await);
        assert_eq!(closed, BrokerError::ChannelClosed);
        assert_eq!(channel.close().await.unwrap_err(), BrokerError::ChannelClosed);

        assert_ok!(connection.close().await);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_close_closes_channels() {
        let broker = MemoryBroker::new();
        let (connection, channel) = open(&broker).await;
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 1);

        assert_ok!(connection.close().await);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);

        let err = channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ChannelClosed);
        assert!(matches!(
            connection.create_channel().await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let broker = MemoryBroker::new();
        broker.fail_next(Operation::NewConnection, 1);
        assert!(matches!(
            broker.new_connection().await,
            Err(BrokerError::ConnectionFailed(_))
        ));
        assert_eq!(broker.open_connections(), 0);

        let (connection, channel) = open(&broker).await;
        broker.fail_next(Operation::QueueDeclare, 1);
        assert!(channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .is_err());
        assert!(!broker.has_queue("orders"));

        broker.fail_next(Operation::CloseChannel, 1);
        assert!(channel.close().await.is_err());
        assert_eq!(broker.open_channels(), 1);

        broker.clear_faults();
        assert_ok!(channel.close().await);
        assert_ok!(connection.close().await);
    }

    #[tokio::test]
    async fn test_delete_queue_notifies_consumers() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("orders", QueueOptions::default(), QueueArguments::new())
            .await
            .unwrap();
        assert_eq!(broker.delete_queue("missing").await, None);

        let (consumer, _deliveries, mut cancels) = forwarder();
        let tag = assert_ok!(channel.basic_consume("orders", true, consumer).await);

        assert_eq!(broker.delete_queue("orders").await, Some(0));
        let cancelled = tokio::time::timeout(Duration::from_secs(1), cancels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled, tag);
        assert!(!broker.has_queue("orders"));

        // Client-side cancel after a broker cancel is still accepted
        assert_ok!(channel.basic_cancel(&tag).await);
    }

    #[tokio::test]
    async fn test_auto_delete_queue_removed_after_last_cancel() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open(&broker).await;
        channel
            .queue_declare("temp", QueueOptions::default().auto_delete(true), QueueArguments::new())
            .await
            .unwrap();

        let (consumer, _deliveries, _cancels) = forwarder();
        let tag = assert_ok!(channel.basic_consume("temp", false, consumer).await);
        assert!(broker.has_queue("temp"));

        assert_ok!(channel.basic_cancel(&tag).await);
        assert!(!broker.has_queue("temp"));

        let unknown = assert_err!(channel.basic_cancel(&tag).await);
        assert!(matches!(unknown, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_private_and_dropped_with_connection() {
        let broker = MemoryBroker::new();
        let (owner, owner_channel) = open(&broker).await;
        owner_channel
            .queue_declare("private", QueueOptions::default().exclusive(true), QueueArguments::new())
            .await
            .unwrap();

        let (_other, other_channel) = open(&broker).await;
        let err = other_channel
            .queue_declare("private", QueueOptions::default().exclusive(true), QueueArguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));

        assert_ok!(owner.close().await);
        assert!(!broker.has_queue("private"));
    }
}

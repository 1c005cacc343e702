// In-memory queue: ready messages, subscribers, declaration

use crate::lock;
use crate::shutdown::CancelSender;
use burrow_core::domain::{ConsumerTag, FieldValue, MessageProperties, QueueArguments, QueueOptions};
use burrow_core::port::DeliveryConsumer;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub(crate) const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub(crate) const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
pub(crate) const FIRST_DEATH_QUEUE_HEADER: &str = "x-first-death-queue";
pub(crate) const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";

/// A message sitting in a queue (ready or unacked)
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// What a queue was declared with; re-declarations must match exactly
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Declaration {
    pub options: QueueOptions,
    pub arguments: QueueArguments,
}

pub(crate) struct Subscriber {
    pub cancel: CancelSender,
    pub consumer: Arc<dyn DeliveryConsumer>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    subscribers: HashMap<ConsumerTag, Subscriber>,
    had_subscriber: bool,
}

pub(crate) struct MemoryQueue {
    name: String,
    declaration: Declaration,
    /// Owning connection id for exclusive queues
    owner: Option<u64>,
    state: Mutex<QueueState>,
    notify: Notify,
    deleted: AtomicBool,
}

impl MemoryQueue {
    pub(crate) fn new(name: impl Into<String>, declaration: Declaration, connection_id: u64) -> Self {
        let owner = declaration.options.exclusive.then_some(connection_id);
        Self {
            name: name.into(),
            declaration,
            owner,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declaration(&self) -> &Declaration {
        &self.declaration
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        self.owner
    }

    /// Whether `connection_id` may use this queue
    pub(crate) fn accessible_from(&self, connection_id: u64) -> bool {
        self.owner.map_or(true, |owner| owner == connection_id)
    }

    /// Routing key for rejected messages, if the queue has a dead-letter target
    ///
    /// Only the default exchange is supported as dead-letter exchange.
    pub(crate) fn dead_letter_target(&self) -> Option<&str> {
        match self.declaration.arguments.get(DEAD_LETTER_EXCHANGE_ARG) {
            Some(FieldValue::Str(exchange)) if exchange.is_empty() => {}
            _ => return None,
        }
        match self.declaration.arguments.get(DEAD_LETTER_ROUTING_KEY_ARG) {
            Some(FieldValue::Str(routing_key)) => Some(routing_key.as_str()),
            _ => None,
        }
    }

    pub(crate) fn push_back(&self, message: StoredMessage) {
        lock(&self.state).ready.push_back(message);
        self.notify.notify_waiters();
    }

    /// Put messages back at the head, preserving their relative order
    pub(crate) fn requeue_front(&self, messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }
        {
            let mut state = lock(&self.state);
            for mut message in messages.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }

    /// Return a message that was taken but never delivered
    pub(crate) fn unshift(&self, message: StoredMessage) {
        lock(&self.state).ready.push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.state).ready.pop_front()
    }

    /// Wait for the next ready message
    ///
    /// Cancel-safe: a message is only taken from the queue when the future
    /// completes.
    pub(crate) async fn next_message(&self) -> StoredMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.pop() {
                return message;
            }
            notified.await;
        }
    }

    pub(crate) fn depth(&self) -> usize {
        lock(&self.state).ready.len()
    }

    pub(crate) fn bodies(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .ready
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }

    pub(crate) fn subscribe(&self, consumer_tag: ConsumerTag, subscriber: Subscriber) {
        let mut state = lock(&self.state);
        state.subscribers.insert(consumer_tag, subscriber);
        state.had_subscriber = true;
    }

    /// Cancel one subscriber; returns true if an auto-delete queue just lost
    /// its last consumer
    pub(crate) fn unsubscribe(&self, consumer_tag: &str) -> bool {
        let mut state = lock(&self.state);
        if let Some(subscriber) = state.subscribers.remove(consumer_tag) {
            subscriber.cancel.cancel();
        }
        self.declaration.options.auto_delete && state.had_subscriber && state.subscribers.is_empty()
    }

    /// Cancel every subscriber, returning them for `on_cancel` notification
    pub(crate) fn cancel_all(&self) -> Vec<(ConsumerTag, Arc<dyn DeliveryConsumer>)> {
        let drained: Vec<_> = lock(&self.state).subscribers.drain().collect();
        drained
            .into_iter()
            .map(|(consumer_tag, subscriber)| {
                subscriber.cancel.cancel();
                (consumer_tag, subscriber.consumer)
            })
            .collect()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Drop all ready messages, returning how many there were
    pub(crate) fn purge(&self) -> usize {
        let mut state = lock(&self.state);
        let count = state.ready.len();
        state.ready.clear();
        count
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

// MemoryConnection - Connection port over the shared broker state

use crate::broker::BrokerState;
use crate::channel::{ChannelInner, MemoryChannel};
use crate::faults::Operation;
use crate::lock;
use async_trait::async_trait;
use burrow_core::port::{BrokerError, Channel, Connection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub(crate) struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerState>,
    channels: Mutex<Vec<Arc<ChannelInner>>>,
    next_channel_id: AtomicU64,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub(crate) fn new(id: u64, broker: Arc<BrokerState>) -> Self {
        Self {
            id,
            broker,
            channels: Mutex::new(Vec::new()),
            next_channel_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.broker.check(Operation::CreateChannel)?;

        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::new(ChannelInner::new(channel_id, self.id, self.broker.clone()));
        {
            let mut channels = lock(&self.channels);
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::ConnectionClosed);
            }
            channels.push(inner.clone());
        }
        self.broker.channel_opened();
        debug!(connection = self.id, channel = channel_id, "Channel opened");

        Ok(Arc::new(MemoryChannel::new(inner)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.broker.check(Operation::CloseConnection)?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }

        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels {
            channel.shutdown();
        }
        self.broker.remove_exclusive(self.id);
        self.broker.connection_closed();
        debug!(connection = self.id, "Connection closed");
        Ok(())
    }
}

// Active listener registration and its teardown

use super::delivery::InFlight;
use crate::application::session::{close_channel, close_connection, log_release_failure};
use crate::domain::{ConsumerTag, QueueName};
use crate::port::{Channel, Connection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Resources owned by one active `register_queue_listener` call
pub(crate) struct Registration {
    pub(crate) consumer_tag: ConsumerTag,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) connection: Box<dyn Connection>,
    /// Entered by the delivery callback while a delivery is being processed
    pub(crate) in_flight: Arc<InFlight>,
}

impl Registration {
    /// Cancel the subscription, drain, then close channel and connection
    ///
    /// Each step runs regardless of earlier failures; failures are logged.
    pub(crate) async fn release(self, queue: &QueueName, drain_timeout: Duration) {
        self.in_flight.release();
        if let Err(e) = self.channel.basic_cancel(&self.consumer_tag).await {
            log_release_failure(queue, "consumer", e);
        }

        // Kept until the channel is closed so no delivery starts in between
        let idle = self.in_flight.drain(drain_timeout).await;
        if idle.is_none() {
            warn!(
                queue = %queue,
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "In-flight delivery still running after drain timeout, closing anyway"
            );
        }

        close_channel(self.channel.as_ref(), queue).await;
        drop(idle);
        close_connection(self.connection.as_ref(), queue).await;

        info!(queue = %queue, consumer_tag = %self.consumer_tag, "Queue listener unregistered");
    }
}

// Consumer dispatch loop (one task per consumer)

use crate::channel::ChannelInner;
use crate::queue::MemoryQueue;
use crate::shutdown::CancelToken;
use burrow_core::domain::{ConsumerTag, Delivery};
use burrow_core::port::DeliveryConsumer;
use std::sync::Arc;
use tracing::debug;

/// Pull messages from `queue` and push them to `consumer` until cancelled
pub(crate) async fn run_consumer(
    channel: Arc<ChannelInner>,
    queue: Arc<MemoryQueue>,
    consumer_tag: ConsumerTag,
    consumer: Arc<dyn DeliveryConsumer>,
    auto_ack: bool,
    mut cancel: CancelToken,
) {
    debug!(queue = queue.name(), consumer_tag = %consumer_tag, "Dispatch loop started");

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = queue.next_message() => message,
        };

        let _turn = channel.dispatch_turn().await;
        if cancel.is_cancelled() || queue.is_deleted() {
            queue.unshift(message);
            break;
        }
        let Some(delivery_tag) = channel.track(&queue, &message, auto_ack) else {
            queue.unshift(message);
            break;
        };

        consumer
            .on_delivery(Delivery {
                delivery_tag,
                consumer_tag: consumer_tag.clone(),
                routing_key: message.routing_key,
                redelivered: message.redelivered,
                properties: message.properties,
                body: message.body,
            })
            .await;
    }

    debug!(queue = queue.name(), consumer_tag = %consumer_tag, "Dispatch loop stopped");
}

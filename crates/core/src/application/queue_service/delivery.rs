// Delivery handling - decode, handle, then ack or dead-letter
use super::QueueHandler;
use crate::application::codec::{Codec, CodecError};
use crate::domain::{Delivery, DeliveryTag, QueueName};
use crate::port::{Channel, DeliveryConsumer};
use async_trait::async_trait;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Why a delivery was rejected
#[derive(Error, Debug)]
pub enum DeliveryFailure {
    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Handler error: {0:#}")]
    Handler(anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Result of decoding and handling one delivery
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Handler succeeded, ack
    Handled,
    /// Nack without requeue, the broker routes it to the dead-letter queue
    Rejected(DeliveryFailure),
}

/// Shared between the delivery callback and the registration teardown
///
/// The lock is held while a delivery is processed. Once released, callbacks
/// that arrive late leave their message unsettled; closing the channel
/// requeues it.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    lock: Mutex<()>,
    released: AtomicBool,
}

impl InFlight {
    /// Enter a delivery, or `None` if the registration is being released
    pub(crate) async fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.lock.lock().await;
        if self.released.load(Ordering::SeqCst) {
            None
        } else {
            Some(guard)
        }
    }

    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Wait for the running delivery to finish, at most `timeout`
    pub(crate) async fn drain(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        tokio::time::timeout(timeout, self.lock.lock()).await.ok()
    }
}

/// Delivery callback registered with the broker for one queue service
///
/// Never lets an error escape `on_delivery`: an escaped failure would end
/// the broker's dispatch loop for this consumer.
pub(crate) struct QueueConsumer<T, H, C> {
    queue: QueueName,
    codec: Arc<C>,
    handler: Arc<H>,
    channel: Arc<dyn Channel>,
    in_flight: Arc<InFlight>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H, C> QueueConsumer<T, H, C>
where
    T: Send + 'static,
    H: QueueHandler<T>,
    C: Codec<T> + 'static,
{
    pub(crate) fn new(
        queue: QueueName,
        codec: Arc<C>,
        handler: Arc<H>,
        channel: Arc<dyn Channel>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            queue,
            codec,
            handler,
            channel,
            in_flight,
            _payload: PhantomData,
        }
    }

    /// Decode and handle in a separate task so a panicking handler becomes
    /// an outcome instead of tearing down the dispatch loop
    async fn process(&self, body: Vec<u8>) -> DeliveryOutcome {
        let codec = Arc::clone(&self.codec);
        let handler = Arc::clone(&self.handler);

        let task = tokio::task::spawn(async move {
            let message = match codec.decode(&body) {
                Ok(message) => message,
                Err(e) => return DeliveryOutcome::Rejected(DeliveryFailure::Decode(e)),
            };
            match handler.receive(message).await {
                Ok(()) => DeliveryOutcome::Handled,
                Err(e) => DeliveryOutcome::Rejected(DeliveryFailure::Handler(e)),
            }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                DeliveryOutcome::Rejected(DeliveryFailure::Panicked(panic_message(
                    join_err.into_panic().as_ref(),
                )))
            }
            Err(join_err) => DeliveryOutcome::Rejected(DeliveryFailure::Panicked(format!(
                "handler task cancelled: {join_err}"
            ))),
        }
    }

    async fn settle(&self, delivery_tag: DeliveryTag, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Handled => {
                match self.channel.basic_ack(delivery_tag, false).await {
                    Ok(()) => debug!(queue = %self.queue, delivery_tag, "Delivery acknowledged"),
                    Err(e) => error!(
                        queue = %self.queue,
                        delivery_tag,
                        error = %e,
                        "Failed to ack delivery"
                    ),
                }
            }
            DeliveryOutcome::Rejected(failure) => {
                error!(
                    queue = %self.queue,
                    delivery_tag,
                    error = %failure,
                    "Delivery rejected, routing to dead-letter queue"
                );
                if let Err(e) = self.channel.basic_nack(delivery_tag, false, false).await {
                    error!(
                        queue = %self.queue,
                        delivery_tag,
                        error = %e,
                        "Failed to nack delivery"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<T, H, C> DeliveryConsumer for QueueConsumer<T, H, C>
where
    T: Send + 'static,
    H: QueueHandler<T>,
    C: Codec<T> + 'static,
{
    async fn on_delivery(&self, delivery: Delivery) {
        // Held for the whole delivery so unregister can drain before closing
        let Some(_in_flight) = self.in_flight.enter().await else {
            debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "Listener released, leaving delivery for redelivery"
            );
            return;
        };

        if delivery.redelivered {
            debug!(queue = %self.queue, delivery_tag = delivery.delivery_tag, "Redelivered message");
        }

        let outcome = self.process(delivery.body).await;
        self.settle(delivery.delivery_tag, outcome).await;
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        warn!(
            queue = %self.queue,
            consumer_tag,
            "Consumer cancelled by broker, no further deliveries until re-registered"
        );
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(static_str.as_ref()), "static");

        let owned: Box<dyn Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(other.as_ref()), "Unknown panic");
    }

    #[tokio::test]
    async fn test_in_flight_refuses_entry_after_release() {
        let in_flight = InFlight::default();
        assert!(in_flight.enter().await.is_some());

        in_flight.release();
        assert!(in_flight.enter().await.is_none());
        assert!(in_flight.drain(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_drain_times_out_while_held() {
        let in_flight = InFlight::default();
        let _held = in_flight.enter().await.unwrap();
        assert!(in_flight.drain(Duration::from_millis(10)).await.is_none());
    }

    #[test]
    fn test_failure_display() {
        let failure = DeliveryFailure::Handler(anyhow::anyhow!("db down").context("saving order"));
        assert_eq!(failure.to_string(), "Handler error: saving order: db down");

        let failure = DeliveryFailure::from(CodecError::EmptyBody);
        assert_eq!(failure.to_string(), "Decode error: Empty message body");
    }
}

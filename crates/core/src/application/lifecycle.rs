// Queue Lifecycle - start/stop every queue listener as one unit

use crate::application::queue_service::QueueListener;
use crate::error::{QueueError, Result};
use crate::port::ConsumerFlag;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Drives registration of all queue listeners known to the process
///
/// Holds no state besides the listener set and the consumer flag. The flag
/// is read on every `start`/`stop`, so toggling it changes the next call.
pub struct QueueLifecycle {
    listeners: Vec<Arc<dyn QueueListener>>,
    flag: Arc<dyn ConsumerFlag>,
}

impl QueueLifecycle {
    pub fn new(flag: Arc<dyn ConsumerFlag>) -> Self {
        Self {
            listeners: Vec::new(),
            flag,
        }
    }

    pub fn with_listeners(flag: Arc<dyn ConsumerFlag>, listeners: Vec<Arc<dyn QueueListener>>) -> Self {
        let mut lifecycle = Self::new(flag);
        for listener in listeners {
            lifecycle.add(listener);
        }
        lifecycle
    }

    /// Add a listener to the set (adding the same instance twice is ignored)
    pub fn add(&mut self, listener: Arc<dyn QueueListener>) {
        let ptr = Arc::as_ptr(&listener) as *const ();
        if self
            .listeners
            .iter()
            .any(|known| Arc::as_ptr(known) as *const () == ptr)
        {
            debug!(queue = %listener.name(), "Listener already known, ignoring");
            return;
        }
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Register every listener if consumers are enabled
    ///
    /// Listeners that are already registered are skipped. The first real
    /// registration failure is returned; listeners registered before it stay
    /// active until `stop`.
    pub async fn start(&self) -> Result<()> {
        if !self.flag.consumers_enabled() {
            info!("Consumers disabled, not registering queue listeners");
            return Ok(());
        }

        info!(listeners = self.listeners.len(), "Consumers enabled");
        for listener in &self.listeners {
            let queue = listener.name();
            info!(queue = %queue, "Registering queue listener");

            match listener.register_queue_listener().await {
                Ok(()) => {}
                Err(QueueError::AlreadyRegistered(_)) => {
                    debug!(queue = %queue, "Queue listener already registered");
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Queue listener registration failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unregister every listener if consumers are enabled
    pub async fn stop(&self) {
        if !self.flag.consumers_enabled() {
            debug!("Consumers disabled, nothing to unregister");
            return;
        }

        info!(listeners = self.listeners.len(), "Unregistering queue listeners");
        join_all(
            self.listeners
                .iter()
                .map(|listener| listener.unregister_queue_listener()),
        )
        .await;
    }
}

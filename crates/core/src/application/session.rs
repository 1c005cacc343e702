// Channel Session - scoped connection + channel for one operation

use crate::domain::QueueName;
use crate::error::{QueueError, Result};
use crate::port::{Channel, Connection, ConnectionFactory};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Run `op` on a freshly opened channel, then close channel and connection
///
/// Both resources are closed on every exit path: success, `op` error, or a
/// channel that could not be created after the connection opened. Close
/// failures are logged and never replace the operation's own result.
///
/// # Errors
/// - QueueError::Connectivity if the connection or channel cannot be opened
/// - whatever `op` returns
pub async fn with_channel<F, Fut, R>(
    factory: &dyn ConnectionFactory,
    queue: &QueueName,
    op: F,
) -> Result<R>
where
    F: FnOnce(Arc<dyn Channel>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let connection = factory.new_connection().await?;

    let channel = match connection.create_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            close_connection(connection.as_ref(), queue).await;
            return Err(QueueError::Connectivity(e));
        }
    };

    let result = op(Arc::clone(&channel)).await;

    close_channel(channel.as_ref(), queue).await;
    close_connection(connection.as_ref(), queue).await;

    result
}

/// Close a channel, logging (not returning) any failure
pub(crate) async fn close_channel(channel: &dyn Channel, queue: &QueueName) {
    if let Err(e) = channel.close().await {
        log_release_failure(queue, "channel", e);
    }
}

/// Close a connection, logging (not returning) any failure
pub(crate) async fn close_connection(connection: &dyn Connection, queue: &QueueName) {
    if let Err(e) = connection.close().await {
        log_release_failure(queue, "connection", e);
    }
}

pub(crate) fn log_release_failure(
    queue: &QueueName,
    resource: &'static str,
    source: crate::port::BrokerError,
) {
    let err = QueueError::ResourceRelease {
        queue: queue.to_string(),
        resource,
        source,
    };
    warn!(queue = %queue, resource, error = %err, "Resource release failed");
}

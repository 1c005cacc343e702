// Queue Topology - primary queue + dead-letter queue declaration

use crate::domain::{FieldValue, QueueArguments, QueueName, QueueOptions};
use crate::error::{QueueError, Result};
use crate::port::{BrokerError, Channel};
use tracing::debug;

/// Name of the default (nameless, direct) exchange
pub const DEFAULT_EXCHANGE: &str = "";

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Arguments routing rejected messages of `queue` to its dead-letter queue
pub fn dead_letter_arguments(queue: &QueueName) -> QueueArguments {
    let mut arguments = QueueArguments::new();
    arguments.insert(
        DEAD_LETTER_EXCHANGE_ARG.to_string(),
        FieldValue::from(DEFAULT_EXCHANGE),
    );
    arguments.insert(
        DEAD_LETTER_ROUTING_KEY_ARG.to_string(),
        FieldValue::from(queue.dead_letter()),
    );
    arguments
}

/// Declare `<queue>_dlq` and then `queue` wired to it
///
/// The dead-letter queue is always declared first so it exists before any
/// message can be rejected from the primary queue. Repeating the call with
/// the same options is harmless.
///
/// # Errors
/// - QueueError::TopologyConflict if an existing queue was declared differently
/// - QueueError::Connectivity for any other broker failure
pub async fn declare(channel: &dyn Channel, queue: &QueueName, options: QueueOptions) -> Result<()> {
    let dead_letter = queue.dead_letter();

    channel
        .queue_declare(&dead_letter, options, QueueArguments::new())
        .await
        .map_err(|e| map_declare_error(&dead_letter, e))?;

    channel
        .queue_declare(queue.as_str(), options, dead_letter_arguments(queue))
        .await
        .map_err(|e| map_declare_error(queue.as_str(), e))?;

    debug!(queue = %queue, dead_letter = %dead_letter, ?options, "Queue topology declared");
    Ok(())
}

fn map_declare_error(queue: &str, err: BrokerError) -> QueueError {
    match err {
        BrokerError::PreconditionFailed(_) => QueueError::TopologyConflict {
            queue: queue.to_string(),
            source: err,
        },
        other => QueueError::Connectivity(other),
    }
}

// Queue service constants
use std::time::Duration;

/// Upper bound unregister waits for an in-flight delivery before closing (5s)
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// Queue Domain Model

use super::error::{DomainError, Result};
use std::fmt;

/// Suffix appended to a queue name to derive its dead-letter queue
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// AMQP short-string limit for queue names (bytes)
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Prefix reserved by the broker for server-named queues
const RESERVED_PREFIX: &str = "amq.";

/// Validated queue name
///
/// Every queue owns a paired dead-letter queue named `<name>_dlq`, so the
/// length check is applied to the derived name as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.trim().is_empty() {
            return Err(DomainError::InvalidQueueName(
                "queue name cannot be empty".to_string(),
            ));
        }

        if name.len() + DEAD_LETTER_SUFFIX.len() > MAX_QUEUE_NAME_LEN {
            return Err(DomainError::InvalidQueueName(format!(
                "queue name too long: {} bytes (max {} including '{}')",
                name.len(),
                MAX_QUEUE_NAME_LEN,
                DEAD_LETTER_SUFFIX
            )));
        }

        if name.starts_with(RESERVED_PREFIX) {
            return Err(DomainError::InvalidQueueName(format!(
                "'{}' uses the reserved '{}' prefix",
                name, RESERVED_PREFIX
            )));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the paired dead-letter queue
    pub fn dead_letter(&self) -> String {
        format!("{}{}", self.0, DEAD_LETTER_SUFFIX)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for QueueName {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// Queue durability semantics (all false unless overridden)
///
/// Fixed for the lifetime of a queue service. The same options are used for
/// the primary queue and its dead-letter queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_name() {
        let queue = QueueName::new("orders").unwrap();
        assert_eq!(queue.dead_letter(), "orders_dlq");
        assert_eq!(queue.to_string(), "orders");
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = QueueName::new("   ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_name_too_long_counts_dead_letter_suffix() {
        assert!(QueueName::new("a".repeat(MAX_QUEUE_NAME_LEN - DEAD_LETTER_SUFFIX.len())).is_ok());

        let err = QueueName::new("a".repeat(MAX_QUEUE_NAME_LEN - 1)).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let err = QueueName::try_from("amq.gen-123").unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_options_default_all_false() {
        let options = QueueOptions::default();
        assert!(!options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);

        let options = options.durable(true).auto_delete(true);
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(options.auto_delete);
    }
}

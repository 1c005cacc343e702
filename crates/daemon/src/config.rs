// Daemon configuration (environment variables)

use burrow_core::port::consumer_flag::parse_flag;
use burrow_core::{QueueError, QueueName, QueueOptions, Result};
use std::time::Duration;

pub const LOG_FORMAT_ENV: &str = "BURROW_LOG_FORMAT";
pub const DEMO_QUEUE_ENV: &str = "BURROW_DEMO_QUEUE";
pub const DEMO_DURABLE_ENV: &str = "BURROW_DEMO_DURABLE";

const DEFAULT_DEMO_QUEUE: &str = "burrow.greetings";

/// Upper bound for unregistering every listener on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Anything other than `json` falls back to pretty output
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub demo_queue: QueueName,
    pub demo_options: QueueOptions,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let queue = lookup(DEMO_QUEUE_ENV).unwrap_or_else(|| DEFAULT_DEMO_QUEUE.to_string());
        let demo_queue = QueueName::new(queue)
            .map_err(|e| QueueError::Config(format!("{}: {}", DEMO_QUEUE_ENV, e)))?;

        let durable = parse_flag(lookup(DEMO_DURABLE_ENV).as_deref());

        Ok(Self {
            demo_queue,
            demo_options: QueueOptions::default().durable(durable),
        })
    }
}

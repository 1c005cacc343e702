//! Burrow Daemon - Main Entry Point
//! Queue services over the in-memory broker, started and stopped by the lifecycle

mod config;
mod greeting;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use burrow_core::port::{ConnectionFactory, EnvConsumerFlag};
use burrow_core::{QueueLifecycle, QueueListener, QueueService};
use burrow_infra_memory::MemoryBroker;

use config::{DaemonConfig, LogFormat, SHUTDOWN_TIMEOUT};
use greeting::{Greeting, GreetingHandler};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("burrow=info"))
        .context("Failed to create env filter")?;

    match LogFormat::from_env() {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("Burrow daemon v{} starting...", VERSION);

    // 2. Load configuration
    let config = DaemonConfig::from_env()?;
    info!(
        queue = %config.demo_queue,
        durable = config.demo_options.durable,
        "Configuration loaded"
    );

    // 3. Setup dependencies (DI wiring)
    let broker = MemoryBroker::new();
    let factory: Arc<dyn ConnectionFactory> = Arc::new(broker.clone());

    let greetings = Arc::new(QueueService::with_options(
        factory,
        config.demo_queue.clone(),
        config.demo_options,
        GreetingHandler,
    ));

    let lifecycle = QueueLifecycle::with_listeners(
        Arc::new(EnvConsumerFlag::new()),
        vec![greetings.clone() as Arc<dyn QueueListener>],
    );

    // 4. Register queue listeners
    lifecycle.start().await?;

    // 5. Publish a few greetings (the blank one ends up in the dead-letter queue)
    for (id, text) in [(1, "hello"), (2, ""), (3, "goodbye")] {
        greetings
            .send(&Greeting {
                id,
                text: text.to_string(),
            })
            .await?;
    }

    info!("System ready. Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Exiting gracefully...");

    // 7. Graceful shutdown
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, lifecycle.stop())
        .await
        .is_err()
    {
        warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Listener shutdown timed out");
    }

    let dead_letter = config.demo_queue.dead_letter();
    info!(
        queue = %config.demo_queue,
        ready = broker.queue_depth(config.demo_queue.as_str()).unwrap_or(0),
        dead_lettered = broker.queue_depth(&dead_letter).unwrap_or(0),
        "Shutdown complete."
    );

    Ok(())
}

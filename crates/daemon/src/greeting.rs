// Demo payload and handler

use anyhow::bail;
use async_trait::async_trait;
use burrow_core::QueueHandler;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub id: u64,
    pub text: String,
}

/// Logs every greeting; blank greetings are rejected (and dead-lettered)
pub struct GreetingHandler;

#[async_trait]
impl QueueHandler<Greeting> for GreetingHandler {
    async fn receive(&self, message: Greeting) -> anyhow::Result<()> {
        if message.text.trim().is_empty() {
            bail!("greeting {} has no text", message.id);
        }
        info!(id = message.id, text = %message.text, "Greeting received");
        Ok(())
    }
}

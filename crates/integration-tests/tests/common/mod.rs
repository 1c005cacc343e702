//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use burrow_core::QueueHandler;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub item: String,
}

pub fn order(id: u64) -> Order {
    Order {
        id,
        item: format!("item-{}", id),
    }
}

pub fn decode(body: &[u8]) -> Order {
    serde_json::from_slice(body).unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Accepts every order and remembers it
#[derive(Clone, Default)]
pub struct Recorder {
    pub received: Arc<Mutex<Vec<Order>>>,
}

impl Recorder {
    pub fn received(&self) -> Vec<Order> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueHandler<Order> for Recorder {
    async fn receive(&self, message: Order) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

/// Rejects every order
#[derive(Clone, Default)]
pub struct Rejector {
    pub calls: Arc<AtomicUsize>,
}

impl Rejector {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueHandler<Order> for Rejector {
    async fn receive(&self, message: Order) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("order {} rejected", message.id)
    }
}

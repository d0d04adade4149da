//! Fire transport between trigger emission and fire execution.
//!
//! The cron triggers enqueue fire payloads; the worker pool consumes
//! them. The broker is an at-least-once black box to the dispatcher;
//! the in-memory implementation backs single-process deployments and
//! the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// One scheduled fire of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirePayload {
    /// Globally unique task name.
    pub task: String,
    /// The instant the trigger fired; base for the frame timestamp.
    pub fired_at: DateTime<Utc>,
}

/// Abstract message-queue interface: enqueue a fire, consume the next.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, payload: FirePayload) -> anyhow::Result<()>;

    /// Next payload, or `None` once the broker is closed and drained.
    async fn recv(&self) -> Option<FirePayload>;

    /// Stop accepting new payloads; `recv` drains what is left.
    fn close(&self);
}

/// Tokio-channel broker for single-process flows.
pub struct MemoryBroker {
    tx: Mutex<Option<mpsc::UnboundedSender<FirePayload>>>,
    rx: Mutex<mpsc::UnboundedReceiver<FirePayload>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, payload: FirePayload) -> anyhow::Result<()> {
        let guard = self.tx.lock().await;
        match guard.as_ref() {
            Some(tx) => {
                tx.send(payload)
                    .map_err(|_| anyhow::anyhow!("broker receiver dropped"))?;
                Ok(())
            }
            None => anyhow::bail!("broker is closed"),
        }
    }

    async fn recv(&self) -> Option<FirePayload> {
        self.rx.lock().await.recv().await
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.try_lock() {
            guard.take();
        }
    }
}

//! # FIFO Message Queues
//!
//! pgmq-backed blocking FIFO queues, one command/response pair per RPC
//! channel. pgmq queue names become table names, so the hierarchical node
//! paths are flattened into short, digest-qualified identifiers that both
//! sides derive independently.

use std::time::Duration;

use pgmq::PGMQueue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{GridError, GridResult};

/// Which side of an RPC channel a queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    Command,
    Response,
}

impl QueueDirection {
    fn suffix(self) -> &'static str {
        match self {
            QueueDirection::Command => "cmd",
            QueueDirection::Response => "rsp",
        }
    }
}

/// Derive the pgmq queue name for one direction of a node's RPC channel.
///
/// pgmq prefixes queue names internally and PostgreSQL caps identifiers at 63
/// bytes, so the name is a truncated digest of the full path plus a readable
/// tail. Deterministic, lowercase, always well under the limit.
pub fn queue_name(node_path: &str, direction: QueueDirection) -> String {
    let full = format!("{node_path}/{}", direction.suffix());
    let digest = Sha256::digest(full.as_bytes());
    let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();

    let tail: String = node_path
        .rsplit('/')
        .next()
        .unwrap_or("")
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '_' || c == '-' {
                Some('_')
            } else {
                None
            }
        })
        .take(16)
        .collect();

    format!("q{hex}_{tail}_{}", direction.suffix())
}

/// One pgmq queue: offer, blocking take (poll loop), and lifecycle
#[derive(Debug, Clone)]
pub struct MessageQueue {
    pgmq: PGMQueue,
    name: String,
    poll_interval: Duration,
}

impl MessageQueue {
    pub fn new(pgmq: PGMQueue, name: String, poll_interval: Duration) -> Self {
        Self {
            pgmq,
            name,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the queue if it does not exist. Both ends of a channel call
    /// this; whichever runs first wins.
    pub async fn ensure(&self) -> GridResult<()> {
        debug!("📋 Ensuring queue exists: {}", self.name);
        self.pgmq
            .create(&self.name)
            .await
            .map_err(|e| GridError::queue(&self.name, "create", e.to_string()))
    }

    /// Append one message
    pub async fn offer<T: Serialize + Sync>(&self, message: &T) -> GridResult<i64> {
        let value = serde_json::to_value(message)?;
        let message_id = self
            .pgmq
            .send(&self.name, &value)
            .await
            .map_err(|e| GridError::queue(&self.name, "send", e.to_string()))?;
        debug!("📤 Sent message {} to {}", message_id, self.name);
        Ok(message_id)
    }

    /// Take one message if immediately available
    pub async fn try_take(&self) -> GridResult<Option<serde_json::Value>> {
        let message = self
            .pgmq
            .pop::<serde_json::Value>(&self.name)
            .await
            .map_err(|e| GridError::queue(&self.name, "pop", e.to_string()))?;
        Ok(message.map(|m| m.message))
    }

    /// Blocking take: poll until a message arrives or the shutdown signal
    /// fires. Returns `None` on shutdown.
    pub async fn take(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> GridResult<Option<serde_json::Value>> {
        loop {
            if let Some(value) = self.try_take().await? {
                return Ok(Some(value));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.recv() => {
                    debug!("take loop on {} shut down", self.name);
                    return Ok(None);
                }
            }
        }
    }

    /// Typed take built on [`Self::take`]
    pub async fn take_as<T: DeserializeOwned>(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> GridResult<Option<T>> {
        match self.take(shutdown).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Delete all pending messages
    pub async fn purge(&self) -> GridResult<u64> {
        self.pgmq
            .purge(&self.name)
            .await
            .map_err(|e| GridError::queue(&self.name, "purge", e.to_string()))
    }

    /// Drop the queue entirely. Best-effort teardown helper.
    pub async fn destroy(&self) {
        debug!("🗑️ Dropping queue: {}", self.name);
        if let Err(e) = self.pgmq.destroy(&self.name).await {
            debug!("failed to drop queue {}: {e}", self.name);
        }
    }
}

//! # RPC Wire Messages
//!
//! Request/response envelopes exchanged over a node's command and response
//! queues. `id` is the unit of correlation: a client allocates monotonically
//! increasing ids and the server echoes the id back on exactly one response
//! per request. Delivery order across ids is not guaranteed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};
use crate::rpc::command::Command;

/// Request id reserved for the internal abort sentinel enqueued by
/// `RpcServer::close`. Clients start allocating at 1 and never use it.
pub const ABORT_REQUEST_ID: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
    pub command: Command,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self {
            id,
            sent_at: Utc::now(),
            command,
        }
    }

    /// Wall-clock time this request has spent enqueued, clamped at zero for
    /// skewed clocks.
    pub fn queued_for_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.sent_at)
            .num_milliseconds()
            .max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Unwrap the carried result, converting a shipped error back into a
    /// caller-side failure attributed to `node_path`.
    pub fn into_result(self, node_path: &str) -> GridResult<serde_json::Value> {
        match self.error {
            Some(message) => Err(GridError::remote(node_path, message)),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

//! # Error Types
//!
//! Structured error handling for the orchestration core using thiserror.
//! The variants mirror the failure taxonomy of the system: backend/transport
//! errors, remote execution errors shipped back over the RPC channel,
//! liveness failures, and local-only timeouts. Callers rely on the variant
//! kind to tell "it may still be running" (timeout) apart from "it has
//! failed" (remote/liveness).

use thiserror::Error;

/// Errors raised by cluster orchestration, RPC, and coordination primitives
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Backend connection error: {message}")]
    Backend { message: String },

    #[error("Backend query error: {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    Queue {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Remote execution failed on {node_id}: {message}")]
    Remote { node_id: String, message: String },

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("RPC channel to {node_id} is closed")]
    ChannelClosed { node_id: String },

    #[error("Process {pid} is not alive")]
    ProcessDead { pid: u32 },

    #[error("Failed to spawn {node_id}: {message}")]
    Spawn { node_id: String, message: String },

    #[error("Barrier {name} is broken: {message}")]
    BarrierBroken { name: String, message: String },

    #[error("Unknown node id: {node_id}")]
    UnknownNode { node_id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Cluster initialization failed: {message}")]
    Init { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GridError {
    /// Create a backend connection error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a backend query error
    pub fn query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Queue {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a remote execution error
    pub fn remote(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a closed-channel error
    pub fn channel_closed(node_id: impl Into<String>) -> Self {
        Self::ChannelClosed {
            node_id: node_id.into(),
        }
    }

    /// Create a spawn failure error
    pub fn spawn(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a broken-barrier error
    pub fn barrier_broken(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BarrierBroken {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a cluster initialization error
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for timeout-kind errors; the remote work may still complete
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for GridError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => GridError::query("query", "no rows found"),
            sqlx::Error::Database(db_err) => GridError::query("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => GridError::backend("database pool timed out"),
            sqlx::Error::PoolClosed => GridError::backend("database pool is closed"),
            sqlx::Error::Configuration(config_err) => GridError::config(config_err.to_string()),
            _ => GridError::backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            GridError::Deserialization {
                message: err.to_string(),
            }
        } else {
            GridError::Serialization {
                message: err.to_string(),
            }
        }
    }
}

impl From<pgmq::errors::PgmqError> for GridError {
    fn from(err: pgmq::errors::PgmqError) -> Self {
        GridError::queue("unknown", "pgmq", err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::internal(err.to_string())
    }
}

/// Result type alias for orchestration operations
pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let backend_err = GridError::backend("connection refused");
        assert!(matches!(backend_err, GridError::Backend { .. }));

        let queue_err = GridError::queue("q_cmd", "send", "failed to send");
        assert!(matches!(queue_err, GridError::Queue { .. }));

        let timeout_err = GridError::timeout("call", 5000);
        assert!(timeout_err.is_timeout());
        assert!(!GridError::channel_closed("c/h").is_timeout());
    }

    #[test]
    fn test_error_conversions() {
        let sqlx_err = sqlx::Error::PoolTimedOut;
        let grid_err: GridError = sqlx_err.into();
        assert!(matches!(grid_err, GridError::Backend { .. }));

        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let grid_err: GridError = json_err.into();
        assert!(matches!(grid_err, GridError::Deserialization { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = GridError::remote("my-cluster/localhost/arr/1", "job panicked");
        let display = format!("{err}");
        assert!(display.contains("Remote execution failed"));
        assert!(display.contains("my-cluster/localhost/arr/1"));
        assert!(display.contains("job panicked"));

        let err = GridError::timeout("barrier enter", 1000);
        assert!(format!("{err}").contains("1000ms"));
    }
}

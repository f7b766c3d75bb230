//! # Node Jobs
//!
//! Work shipped to worker nodes is a `(kind, params)` description, not a
//! serialized closure: every agent carries a `JobRegistry` mapping kind names
//! to async handlers, and a job executes against the worker's own
//! `ClusterTools` and identity. Callers that need custom behavior register
//! their own handlers on the registry before the agent starts serving.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::tools::ClusterTools;

/// Serializable job description dispatched through `ExecuteNodeJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJob {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl NodeJob {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// Everything a job handler gets to work with on the executing node.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub node_id: GlobalNodeId,
    pub tools: ClusterTools,
}

type BoxedJobFuture = Pin<Box<dyn Future<Output = GridResult<Value>> + Send>>;
type JobHandler = Arc<dyn Fn(JobContext, Value) -> BoxedJobFuture + Send + Sync>;

/// Kind-name to handler map. Cheap to share across the agent's dispatch
/// tasks.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: Arc<DashMap<String, JobHandler>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in job vocabulary.
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        registry.register("echo", |_ctx, params| async move { Ok(params) });

        registry.register("sleep_ms", |_ctx, params| async move {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::Null)
        });

        registry.register("fail", |_ctx, params| async move {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("job failed");
            Err(GridError::internal(message))
        });

        registry.register("process_exit", |ctx, params| async move {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            info!("💀 Job-requested process exit({code}) on {}", ctx.node_id);
            std::process::exit(code);
        });

        registry.register("counter_add", |ctx, params| async move {
            let name = required_str(&params, "counter", "counter_add")?;
            let initial = params.get("initial").and_then(Value::as_i64).unwrap_or(0);
            let delta = params.get("delta").and_then(Value::as_i64).unwrap_or(1);

            let counter = ctx.tools.atomic_counter(&name, initial).await?;
            let mut value = counter.get().await?;
            for _ in 0..delta.max(0) {
                value = counter.increment_and_get().await?;
            }
            for _ in 0..(-delta).max(0) {
                value = counter.decrement_and_get().await?;
            }
            Ok(json!(value))
        });

        registry.register("barrier_rendezvous", |ctx, params| async move {
            let name = required_str(&params, "barrier", "barrier_rendezvous")?;
            let parties = required_i64(&params, "parties", "barrier_rendezvous")?;
            let timeout = params
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis);

            let mut barrier = ctx.tools.barrier(&name, parties).await?;
            let index = match timeout {
                Some(t) => barrier.wait_timeout(t).await?,
                None => barrier.wait().await?,
            };
            Ok(json!(index))
        });

        registry.register("rendezvous_count", |ctx, params| async move {
            let barrier_name = required_str(&params, "barrier", "rendezvous_count")?;
            let parties = required_i64(&params, "parties", "rendezvous_count")?;
            let counter_name = required_str(&params, "counter", "rendezvous_count")?;
            let timeout = params
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis);

            let mut barrier = ctx.tools.barrier(&barrier_name, parties).await?;
            let index = match timeout {
                Some(t) => barrier.wait_timeout(t).await?,
                None => barrier.wait().await?,
            };
            let counter = ctx.tools.atomic_counter(&counter_name, 0).await?;
            let count = counter.increment_and_get().await?;
            Ok(json!({"index": index, "count": count}))
        });

        registry
    }

    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GridResult<Value>> + Send + 'static,
    {
        self.handlers.insert(
            kind.into(),
            Arc::new(move |ctx, params| Box::pin(handler(ctx, params))),
        );
    }

    pub fn kinds(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn run(&self, job: NodeJob, context: JobContext) -> GridResult<Value> {
        let handler = self
            .handlers
            .get(&job.kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                GridError::config(format!("unknown job kind '{}', nothing registered", job.kind))
            })?;

        debug!("🏃 Running job '{}' on {}", job.kind, context.node_id);
        handler(context, job.params).await
    }
}

fn required_str(params: &Value, key: &str, job: &str) -> GridResult<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GridError::config(format!("job '{job}' requires string param '{key}'")))
}

fn required_i64(params: &Value, key: &str, job: &str) -> GridResult<i64> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| GridError::config(format!("job '{job}' requires integer param '{key}'")))
}

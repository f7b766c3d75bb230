//! # Coordination Backend Client
//!
//! Everything the cluster shares across process boundaries goes through one
//! PostgreSQL database with the pgmq extension: pgmq queues carry the RPC
//! channels, and two small tables implement the distributed atomic-long and
//! double-barrier recipes. This module owns the connection and the namespace
//! lifecycle; the recipes live in the submodules.
//!
//! Namespace layout (all keys are plain text paths):
//! - counters under `/clients/{clusterId}/AtomicCounter/{name}`
//! - barriers under `/clients/{clusterId}/Barrier/{name}`, with adjoining
//!   counters under `/clients/{clusterId}/Barrier/Counter/{name}`
//! - one pgmq queue pair per host/node id, names derived in [`queue`]

pub mod barrier;
pub mod counter;
pub mod queue;

pub use barrier::DoubleBarrier;
pub use counter::{AtomicValue, DistributedLong};
pub use queue::{queue_name, MessageQueue, QueueDirection};

use std::time::Duration;

use pgmq::PGMQueue;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::{GridError, GridResult};

/// Client for the coordination backend shared by the orchestrator and every
/// agent. Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Coordination {
    pgmq: PGMQueue,
    poll_interval: Duration,
}

impl Coordination {
    /// Connect to the backend and make sure the coordination tables exist
    pub async fn connect(database_url: &str, poll_interval: Duration) -> GridResult<Self> {
        info!("🚀 Connecting to coordination backend");

        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| GridError::backend(format!("pgmq connection failed: {e}")))?;

        let coordination = Self {
            pgmq,
            poll_interval,
        };
        coordination.ensure_schema().await?;

        info!("✅ Coordination backend ready");
        Ok(coordination)
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pgmq.connection
    }

    pub fn pgmq(&self) -> &PGMQueue {
        &self.pgmq
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Open a queue handle for the given derived queue name
    pub fn queue(&self, name: impl Into<String>) -> MessageQueue {
        MessageQueue::new(self.pgmq.clone(), name.into(), self.poll_interval)
    }

    /// Counter recipe handle for a namespace path
    pub fn counter(&self, path: impl Into<String>) -> DistributedLong {
        DistributedLong::new(self.pool().clone(), path.into())
    }

    /// Double-barrier recipe handle for a namespace path
    pub fn barrier(&self, path: impl Into<String>, parties: i64) -> DoubleBarrier {
        DoubleBarrier::new(self.pool().clone(), path.into(), parties, self.poll_interval)
    }

    async fn ensure_schema(&self) -> GridResult<()> {
        debug!("🏗️ Ensuring coordination tables exist");

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS grid_counters (
                path TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS grid_barriers (
                path TEXT PRIMARY KEY,
                parties BIGINT NOT NULL,
                round BIGINT NOT NULL DEFAULT 0,
                entered BIGINT NOT NULL DEFAULT 0,
                leaving BIGINT NOT NULL DEFAULT 0
            )",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Remove every counter and barrier row belonging to a cluster.
    /// Best-effort: failures are logged, teardown continues.
    pub async fn teardown_namespace(&self, cluster_id: &str) {
        let prefix = format!("/clients/{cluster_id}/%");
        info!(cluster_id = %cluster_id, "🗑️ Tearing down coordination namespace");

        if let Err(e) = sqlx::query("DELETE FROM grid_counters WHERE path LIKE $1")
            .bind(&prefix)
            .execute(self.pool())
            .await
        {
            warn!("failed to delete counters for {cluster_id}: {e}");
        }
        if let Err(e) = sqlx::query("DELETE FROM grid_barriers WHERE path LIKE $1")
            .bind(&prefix)
            .execute(self.pool())
            .await
        {
            warn!("failed to delete barriers for {cluster_id}: {e}");
        }
    }

    /// Close the underlying pool. Further operations on any clone will fail.
    pub async fn close(&self) {
        self.pool().close().await;
    }
}

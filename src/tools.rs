//! # Distributed Tools
//!
//! Synchronization primitives handed to job code running inside worker
//! processes. Everything is addressed under the owning cluster's namespace,
//! `/clients/{cluster_id}/...`, so independently scheduled jobs on different
//! nodes (and the orchestrator itself) coordinate through the same backend
//! rows.
//!
//! `Barrier` is single-use: one instance joins exactly one round. Ask the
//! factory for a fresh instance per round when looping.

use std::time::Duration;

use tracing::debug;

use crate::coordination::{AtomicValue, Coordination, DistributedLong, DoubleBarrier};
use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;

/// Optimistic CAS attempts before promoting to the locked update path.
const OPTIMISTIC_TRIES: usize = 3;

/// Factory for cluster-scoped counters and barriers, plus the identity of the
/// process holding it.
#[derive(Debug, Clone)]
pub struct ClusterTools {
    coordination: Coordination,
    node_id: GlobalNodeId,
}

impl ClusterTools {
    pub fn new(coordination: Coordination, node_id: GlobalNodeId) -> Self {
        Self {
            coordination,
            node_id,
        }
    }

    pub fn node_id(&self) -> &GlobalNodeId {
        &self.node_id
    }

    pub fn cluster_id(&self) -> &str {
        self.node_id.cluster_id()
    }

    /// Named counter under this cluster's namespace. Creates the backing row
    /// with `initial` if absent; an existing value is kept.
    pub async fn atomic_counter(&self, name: &str, initial: i64) -> GridResult<AtomicCounter> {
        let path = format!("/clients/{}/AtomicCounter/{}", self.cluster_id(), name);
        let backend = self.coordination.counter(path);
        backend.ensure(initial).await?;
        Ok(AtomicCounter {
            name: name.to_string(),
            backend,
        })
    }

    /// Named barrier for `parties` participants. Also provisions the
    /// adjoining arrival-index counter.
    pub async fn barrier(&self, name: &str, parties: i64) -> GridResult<Barrier> {
        let barrier_path = format!("/clients/{}/Barrier/{}", self.cluster_id(), name);
        let index_path = format!("/clients/{}/Barrier/Counter/{}", self.cluster_id(), name);

        let backend = self.coordination.barrier(barrier_path, parties);
        backend.ensure().await?;
        let index_backend = self.coordination.counter(index_path);
        index_backend.ensure(0).await?;

        Ok(Barrier {
            name: name.to_string(),
            parties,
            barrier: backend,
            index: AtomicCounter {
                name: name.to_string(),
                backend: index_backend,
            },
            used: false,
        })
    }
}

/// Distributed atomic long. Every mutation retries until it wins: a few
/// optimistic CAS rounds first, then the locked update path which serializes
/// contenders.
#[derive(Debug)]
pub struct AtomicCounter {
    name: String,
    backend: DistributedLong,
}

impl AtomicCounter {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, delta: i64) -> GridResult<AtomicValue> {
        for _ in 0..OPTIMISTIC_TRIES {
            let value = self.backend.try_add(delta).await?;
            if value.succeeded {
                return Ok(value);
            }
        }
        debug!(
            "Counter {} contended, promoting to locked update",
            self.name
        );
        let (pre, post) = self.backend.add_with_lock(delta).await?;
        Ok(AtomicValue {
            succeeded: true,
            pre,
            post,
        })
    }

    pub async fn increment_and_get(&self) -> GridResult<i64> {
        Ok(self.add(1).await?.post)
    }

    pub async fn get_and_increment(&self) -> GridResult<i64> {
        Ok(self.add(1).await?.pre)
    }

    pub async fn decrement_and_get(&self) -> GridResult<i64> {
        Ok(self.add(-1).await?.post)
    }

    pub async fn get_and_decrement(&self) -> GridResult<i64> {
        Ok(self.add(-1).await?.pre)
    }

    pub async fn get(&self) -> GridResult<i64> {
        self.backend.get().await
    }

    /// Unconditional write, bypassing CAS.
    pub async fn set(&self, value: i64) -> GridResult<()> {
        self.backend.force_set(value).await
    }

    /// Single CAS attempt. Returns false if the current value was not
    /// `expected`.
    pub async fn compare_and_set(&self, expected: i64, new: i64) -> GridResult<bool> {
        self.backend.compare_and_set(expected, new).await
    }
}

/// N-party rendezvous. `wait` blocks until all parties arrive and returns
/// this caller's 0-based arrival index; the last arriver resets the index
/// counter so a fresh instance starts the next round at 0 again.
#[derive(Debug)]
pub struct Barrier {
    name: String,
    parties: i64,
    barrier: DoubleBarrier,
    index: AtomicCounter,
    used: bool,
}

impl Barrier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> i64 {
        self.parties
    }

    pub async fn wait(&mut self) -> GridResult<i64> {
        self.wait_inner(None).await
    }

    /// Like `wait`, but gives up after `timeout` if fewer than `parties`
    /// arrive. The error is timeout-kind, and a timed-out party leaves the
    /// barrier clean for a fresh round.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> GridResult<i64> {
        self.wait_inner(Some(timeout)).await
    }

    async fn wait_inner(&mut self, timeout: Option<Duration>) -> GridResult<i64> {
        if self.used {
            return Err(GridError::barrier_broken(
                &self.name,
                "barrier instance already used, take a fresh one per round",
            ));
        }
        self.used = true;

        self.barrier.enter(timeout).await?;

        // All parties are in. Indexes are claimed in increment order, so the
        // party that draws parties-1 is the last one and can safely reset.
        let index = self.index.get_and_increment().await?;
        if index == self.parties - 1 {
            self.index.set(0).await?;
        }

        self.barrier.leave().await?;
        debug!("Barrier {} round complete, arrival index {index}", self.name);
        Ok(index)
    }
}

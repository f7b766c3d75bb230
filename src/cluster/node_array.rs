//! # Node Arrays and Job Dispatch
//!
//! A `NodeArray` is a named group of live worker nodes. Dispatch fans a job
//! out to the targeted nodes and always yields one pending call per target:
//! a node whose channel is already dead contributes an already-failed call
//! instead of making the dispatch itself raise.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::jobs::NodeJob;
use crate::process::{self, ProcessRef};
use crate::rpc::{Command, PendingCall, RpcClient};

/// One live worker node: identity, the PID reference its host supervises it
/// by, and the RPC channel to it. Cheap to clone; the cluster's host child
/// lists and the arrays share the same underlying node.
#[derive(Debug, Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Debug)]
struct NodeInner {
    id: GlobalNodeId,
    process: ProcessRef,
    client: RpcClient,
}

impl Node {
    pub(crate) fn new(id: GlobalNodeId, process: ProcessRef, client: RpcClient) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id,
                process,
                client,
            }),
        }
    }

    pub fn id(&self) -> &GlobalNodeId {
        &self.inner.id
    }

    pub fn process(&self) -> ProcessRef {
        self.inner.process
    }

    pub fn client(&self) -> &RpcClient {
        &self.inner.client
    }

    fn local_id(&self) -> String {
        self.inner.id.local_id().unwrap_or_default().to_string()
    }

    /// Round-trip a bare liveness probe. Also refreshes the node's keepalive
    /// timestamp as a side effect.
    pub(crate) async fn check_self(&self, timeout: Duration) -> GridResult<()> {
        self.inner
            .client
            .call_timeout(Command::CheckNode { process: None }, timeout)
            .await
            .map(|_| ())
    }

    pub(crate) async fn close(&self) {
        self.inner.client.close().await;
    }
}

/// Named group of worker nodes, in configuration order.
#[derive(Debug)]
pub struct NodeArray {
    id: String,
    nodes: Vec<Node>,
}

impl NodeArray {
    pub(crate) fn new(id: String, nodes: Vec<Node>) -> Self {
        Self { id, nodes }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Logical node ids, in configuration order.
    pub fn ids(&self) -> Vec<String> {
        self.nodes.iter().map(Node::local_id).collect()
    }

    fn find(&self, local_id: &str) -> GridResult<&Node> {
        self.nodes
            .iter()
            .find(|n| n.local_id() == local_id)
            .ok_or_else(|| GridError::UnknownNode {
                node_id: format!("{}/{local_id}", self.id),
            })
    }

    pub fn hostname_of(&self, local_id: &str) -> GridResult<String> {
        Ok(self.find(local_id)?.id().hostname().to_string())
    }

    /// Scratch directory of a node, as seen from that node.
    pub fn root_path_of(&self, local_id: &str) -> GridResult<PathBuf> {
        Ok(process::scratch_root(self.find(local_id)?.id()))
    }

    /// Fan `job` out to every node in the array.
    pub async fn execute_on_all(&self, job: NodeJob) -> NodeArrayFuture {
        self.dispatch(self.nodes.iter().collect(), job).await
    }

    /// Run `job` on one node.
    pub async fn execute_on(&self, local_id: &str, job: NodeJob) -> GridResult<NodeArrayFuture> {
        let node = self.find(local_id)?;
        Ok(self.dispatch(vec![node], job).await)
    }

    /// Run `job` on a subset of nodes. Unknown ids fail the whole dispatch
    /// before anything is sent.
    pub async fn execute_on_many(
        &self,
        local_ids: &[&str],
        job: NodeJob,
    ) -> GridResult<NodeArrayFuture> {
        let mut targets = Vec::with_capacity(local_ids.len());
        for local_id in local_ids {
            targets.push(self.find(local_id)?);
        }
        Ok(self.dispatch(targets, job).await)
    }

    async fn dispatch(&self, targets: Vec<&Node>, job: NodeJob) -> NodeArrayFuture {
        debug!(
            "Dispatching job '{}' to {} node(s) of array {}",
            job.kind,
            targets.len(),
            self.id
        );
        let mut calls = Vec::with_capacity(targets.len());
        for node in targets {
            let call = node
                .client()
                .call_async(Command::ExecuteNodeJob { job: job.clone() })
                .await;
            calls.push((node.local_id(), call));
        }
        NodeArrayFuture::new(calls)
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Aggregate over the per-node calls of one dispatch. Waiting raises the
/// first per-node failure; it never cancels the sibling calls, so a slow
/// node only delays observation, not the other nodes' server-side work.
#[derive(Debug)]
pub struct NodeArrayFuture {
    calls: Vec<(String, PendingCall)>,
}

impl NodeArrayFuture {
    pub(crate) fn new(calls: Vec<(String, PendingCall)>) -> Self {
        Self { calls }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Wait for every node, raising the first failure.
    pub async fn get(self) -> GridResult<()> {
        for (_, call) in self.calls {
            call.wait().await?;
        }
        Ok(())
    }

    /// Like [`Self::get`] with one shared deadline across all nodes.
    pub async fn get_timeout(self, timeout: Duration) -> GridResult<()> {
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = tokio::time::Instant::now() + timeout;
        for (local_id, call) in self.calls {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(GridError::timeout(format!("job on node {local_id}"), timeout_ms));
            }
            call.wait_timeout(remaining).await?;
        }
        Ok(())
    }

    /// Wait for every node and keep the per-node outcomes instead of
    /// stopping at the first failure.
    pub async fn collect(self) -> Vec<(String, GridResult<serde_json::Value>)> {
        let mut results = Vec::with_capacity(self.calls.len());
        for (local_id, call) in self.calls {
            let result = call.wait().await;
            results.push((local_id, result));
        }
        results
    }
}

//! # Host Registry
//!
//! One `Host` per distinct hostname in the configuration: the host agent's
//! identity, the RPC channel to it, the connect string its children were
//! given, and the live child list. Children are appended while node arrays
//! spawn and iterated by the health-check timer, so the list sits behind an
//! async lock.

use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cluster::node_array::Node;
use crate::error::GridResult;
use crate::identity::GlobalNodeId;
use crate::rpc::{Command, RpcClient};

/// Bounded wait for a host agent to kill one child on teardown.
const KILL_TIMEOUT: Duration = Duration::from_secs(15);
/// Bounded wait for a host agent to acknowledge shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Host {
    id: GlobalNodeId,
    connect_string: String,
    client: RpcClient,
    children: RwLock<Vec<Node>>,
}

impl Host {
    pub(crate) fn new(id: GlobalNodeId, connect_string: String, client: RpcClient) -> Self {
        Self {
            id,
            connect_string,
            client,
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &GlobalNodeId {
        &self.id
    }

    /// Connect string the host agent hands to the workers it spawns.
    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub(crate) async fn adopt(&self, node: Node) {
        self.children.write().await.push(node);
    }

    pub async fn children(&self) -> Vec<Node> {
        self.children.read().await.clone()
    }

    /// One health-check round for this host: ask the agent to verify each
    /// child by PID, then round-trip a self-check through each child. The
    /// first failure of any kind is returned.
    pub(crate) async fn check(&self, timeout: Duration) -> GridResult<()> {
        for child in self.children().await {
            self.client
                .call_timeout(
                    Command::CheckNode {
                        process: Some(child.process()),
                    },
                    timeout,
                )
                .await?;
            child.check_self(timeout).await?;
        }
        debug!("Host {} passed its health check", self.id);
        Ok(())
    }

    /// Tell the agent to kill every child, then close the child channels.
    /// Best-effort teardown.
    pub(crate) async fn kill_children(&self) {
        for child in self.children().await {
            if let Err(e) = self
                .client
                .call_timeout(
                    Command::KillNode {
                        process: child.process(),
                    },
                    KILL_TIMEOUT,
                )
                .await
            {
                warn!("Failed to kill node {} via {}: {e}", child.id(), self.id);
            }
            child.close().await;
        }
    }

    /// Stop the host agent itself and close its channel. Best-effort.
    pub(crate) async fn shutdown_agent(&self) {
        if let Err(e) = self.client.call_timeout(Command::Shutdown, SHUTDOWN_TIMEOUT).await {
            warn!("Host agent {} did not acknowledge shutdown: {e}", self.id);
        }
        self.client.close().await;
    }
}

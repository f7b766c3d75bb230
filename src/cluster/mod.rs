//! # Cluster Orchestrator
//!
//! Top-level lifecycle: provision the coordination backend namespace, bring
//! up one host agent per distinct configured host, have each host spawn its
//! worker nodes, then watch the whole tree with the health-check timer.
//!
//! The state machine is `Unstarted -> Initializing -> Running -> Closed`
//! with no re-entry. Failing anywhere during initialization tears down
//! whatever was already brought up and surfaces the failure, so a caller
//! never holds a half-initialized cluster. A failed health check anywhere
//! force-closes everything: partial cluster states are not supported.

pub mod host;
pub mod node_array;

pub use host::Host;
pub use node_array::{Node, NodeArray, NodeArrayFuture};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ClusterConfiguration, LocalLauncherMode, NodeArrayConfiguration, NodeConfiguration};
use crate::coordination::{queue_name, Coordination, QueueDirection};
use crate::error::{GridError, GridResult};
use crate::identity::{sanitize, GlobalNodeId};
use crate::launcher::{HostLauncher, LocalProcessLauncher, LocalThreadLauncher};
use crate::process::ProcessRef;
use crate::rpc::{Command, RpcClient};
use crate::tools::ClusterTools;

/// Bound on concurrent host agent launches during init.
const MAX_PARALLEL_HOST_LAUNCHES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Unstarted,
    Initializing,
    Running,
    Closed,
}

/// State the health-check timer and teardown share with the owning
/// `Cluster`.
struct Shared {
    id: String,
    coordination: Coordination,
    state: parking_lot::Mutex<ClusterState>,
    hosts: parking_lot::RwLock<Vec<Arc<Host>>>,
    launchers: parking_lot::RwLock<Vec<Arc<dyn HostLauncher>>>,
    health_shutdown: broadcast::Sender<()>,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    teardown_lock: tokio::sync::Mutex<()>,
}

pub struct Cluster {
    shared: Arc<Shared>,
    configuration: ClusterConfiguration,
    tools: ClusterTools,
    arrays: HashMap<String, NodeArray>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("arrays", &self.arrays.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Cluster {
    /// Bring up a cluster under a generated id. Returns only once everything
    /// is running; any failure tears down what was already up.
    pub async fn new(configuration: ClusterConfiguration) -> GridResult<Cluster> {
        Self::with_id(generate_cluster_id(), configuration).await
    }

    /// Like [`Self::new`] with a caller-chosen cluster id.
    pub async fn with_id(
        id: impl Into<String>,
        configuration: ClusterConfiguration,
    ) -> GridResult<Cluster> {
        let id = sanitize(&id.into());
        configuration.validate()?;
        let database_url = configuration.resolve_database_url()?;
        let coordination =
            Coordination::connect(&database_url, configuration.poll_interval()).await?;

        let (health_shutdown, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            id: id.clone(),
            coordination: coordination.clone(),
            state: parking_lot::Mutex::new(ClusterState::Unstarted),
            hosts: parking_lot::RwLock::new(Vec::new()),
            launchers: parking_lot::RwLock::new(Vec::new()),
            health_shutdown,
            health_task: parking_lot::Mutex::new(None),
            teardown_lock: tokio::sync::Mutex::new(()),
        });
        let tools = ClusterTools::new(coordination, GlobalNodeId::host(&id, "orchestrator"));

        let mut cluster = Cluster {
            shared,
            configuration,
            tools,
            arrays: HashMap::new(),
        };

        info!("🎯 Initializing cluster {id}");
        match cluster.init(&database_url).await {
            Ok(()) => {
                *cluster.shared.state.lock() = ClusterState::Running;
                info!("✅ Cluster {id} running");
                Ok(cluster)
            }
            Err(e) => {
                error!("💥 Cluster {id} failed to initialize: {e}");
                cluster.close().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ClusterState {
        *self.shared.state.lock()
    }

    /// Counter/barrier factory for the orchestrating process itself, scoped
    /// to this cluster like the workers' tools are.
    pub fn tools(&self) -> &ClusterTools {
        &self.tools
    }

    pub fn node_array(&self, id: &str) -> GridResult<&NodeArray> {
        self.arrays.get(id).ok_or_else(|| GridError::UnknownNode {
            node_id: id.to_string(),
        })
    }

    pub fn node_array_ids(&self) -> Vec<String> {
        self.arrays.keys().cloned().collect()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.shared.hosts.read().clone()
    }

    /// Tear the whole cluster down: stop the health timer, kill every node
    /// via its host, stop the host agents, close the launchers, and scrub
    /// the backend namespace. Idempotent and safe after a partial init.
    pub async fn close(&self) {
        let _ = self.shared.health_shutdown.send(());
        let task = self.shared.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        teardown(&self.shared).await;
    }

    async fn init(&mut self, database_url: &str) -> GridResult<()> {
        *self.shared.state.lock() = ClusterState::Initializing;

        let hostnames = distinct_hostnames(&self.configuration);
        if hostnames.is_empty() {
            return Err(GridError::config("configuration has no nodes"));
        }

        // Register launchers before launching anything so a partial failure
        // still closes them.
        let mut pairs: Vec<(String, Arc<dyn HostLauncher>)> = Vec::new();
        for hostname in hostnames {
            let launcher = self.launcher_for(&hostname)?;
            self.shared.launchers.write().push(Arc::clone(&launcher));
            pairs.push((hostname, launcher));
        }

        self.launch_hosts(pairs, database_url).await?;
        self.spawn_nodes().await?;
        // Started last so it never observes a half-initialized cluster.
        self.start_health_timer();
        Ok(())
    }

    fn launcher_for(&self, hostname: &str) -> GridResult<Arc<dyn HostLauncher>> {
        if hostname == "localhost" {
            return Ok(match self.configuration.local_launcher_mode() {
                LocalLauncherMode::Thread => Arc::new(LocalThreadLauncher::new(
                    self.configuration.agent_settings(false),
                )),
                LocalLauncherMode::Process => Arc::new(LocalProcessLauncher::new(
                    self.configuration.executable().clone(),
                    self.configuration.agent_settings(true),
                )),
            });
        }
        self.configuration
            .remote_launcher()
            .cloned()
            .ok_or_else(|| {
                GridError::config(format!(
                    "no launcher for remote host '{hostname}': configure one with \
                     with_remote_launcher"
                ))
            })
    }

    /// Launch every host agent in parallel, bounded, each under the overall
    /// launch timeout. Any failure aborts init; successes are still recorded
    /// so teardown can reach them.
    async fn launch_hosts(
        &self,
        pairs: Vec<(String, Arc<dyn HostLauncher>)>,
        database_url: &str,
    ) -> GridResult<()> {
        let launch_timeout = self.configuration.host_launch_timeout();

        let launches = futures::stream::iter(pairs.into_iter().map(|(hostname, launcher)| {
            let cluster_id = self.shared.id.clone();
            let coordination = self.shared.coordination.clone();
            let database_url = database_url.to_string();
            async move {
                let host_id = GlobalNodeId::host(&cluster_id, &hostname);
                info!("🚀 Launching host agent {host_id}");
                let connect_string =
                    tokio::time::timeout(launch_timeout, launcher.launch(&host_id, &database_url))
                        .await
                        .map_err(|_| {
                            GridError::timeout(
                                format!("launch of host {host_id}"),
                                launch_timeout.as_millis() as u64,
                            )
                        })??;
                let client = RpcClient::connect(&coordination, &host_id).await?;
                Ok::<Arc<Host>, GridError>(Arc::new(Host::new(host_id, connect_string, client)))
            }
        }))
        .buffer_unordered(MAX_PARALLEL_HOST_LAUNCHES)
        .collect::<Vec<_>>()
        .await;

        let mut first_error = None;
        for launch in launches {
            match launch {
                Ok(host) => self.shared.hosts.write().push(host),
                Err(e) => match first_error {
                    None => first_error = Some(e),
                    Some(_) => warn!("Additional host launch failure: {e}"),
                },
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn spawn_nodes(&mut self) -> GridResult<()> {
        let spawn_timeout = self.configuration.spawn_timeout();
        let arrays_cfg = self.configuration.node_arrays().to_vec();

        for array_cfg in arrays_cfg {
            let mut nodes = Vec::with_capacity(array_cfg.nodes().len());
            for node_cfg in array_cfg.nodes() {
                nodes.push(self.spawn_node(&array_cfg, node_cfg, spawn_timeout).await?);
            }
            info!(
                "✅ Node array '{}' up with {} node(s)",
                array_cfg.id(),
                nodes.len()
            );
            self.arrays.insert(
                array_cfg.id().to_string(),
                NodeArray::new(array_cfg.id().to_string(), nodes),
            );
        }
        Ok(())
    }

    async fn spawn_node(
        &self,
        array_cfg: &NodeArrayConfiguration,
        node_cfg: &NodeConfiguration,
        spawn_timeout: Duration,
    ) -> GridResult<Node> {
        let host = self.host_for(node_cfg.hostname())?;
        let node_id = GlobalNodeId::node(
            &self.shared.id,
            node_cfg.hostname(),
            array_cfg.id(),
            node_cfg.id(),
        );
        let executable = array_cfg
            .executable()
            .cloned()
            .unwrap_or_else(|| self.configuration.executable().clone());

        let command = Command::SpawnNode {
            node_id: node_id.clone(),
            executable,
            connect_string: host.connect_string().to_string(),
            settings: self.configuration.agent_settings(true),
        };
        let value = host.client().call_timeout(command, spawn_timeout).await?;
        let process: ProcessRef = serde_json::from_value(value)?;
        let client = RpcClient::connect(&self.shared.coordination, &node_id).await?;

        let node = Node::new(node_id.clone(), process, client);
        host.adopt(node.clone()).await;
        info!("🌱 Spawned node {node_id} (pid {})", process.pid);
        Ok(node)
    }

    fn host_for(&self, hostname: &str) -> GridResult<Arc<Host>> {
        let hostname = sanitize(hostname);
        self.shared
            .hosts
            .read()
            .iter()
            .find(|h| h.id().hostname() == hostname)
            .cloned()
            .ok_or_else(|| {
                GridError::internal(format!("no launched host for hostname '{hostname}'"))
            })
    }

    fn start_health_timer(&self) {
        let delay = self.configuration.health_check_delay();
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shared.health_shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = check_hosts(&shared, delay).await {
                    error!(
                        "💥 Health check failed for cluster {}: {e}, force-closing",
                        shared.id
                    );
                    teardown(&shared).await;
                    break;
                }
            }
        });
        *self.shared.health_task.lock() = Some(task);
        info!("⏱️ Health-check timer running every {delay:?}");
    }
}

async fn check_hosts(shared: &Shared, timeout: Duration) -> GridResult<()> {
    let hosts: Vec<Arc<Host>> = shared.hosts.read().clone();
    for host in hosts {
        host.check(timeout).await?;
    }
    Ok(())
}

/// Defensive, idempotent teardown of everything `shared` tracks. Every
/// individual close is best-effort so one dead resource never blocks the
/// rest.
async fn teardown(shared: &Shared) {
    let _guard = shared.teardown_lock.lock().await;
    {
        let mut state = shared.state.lock();
        if *state == ClusterState::Closed {
            return;
        }
        *state = ClusterState::Closed;
    }
    info!("🛑 Closing cluster {}", shared.id);
    let _ = shared.health_shutdown.send(());

    let hosts: Vec<Arc<Host>> = shared.hosts.read().clone();
    for host in &hosts {
        host.kill_children().await;
        for child in host.children().await {
            destroy_queue_pair(&shared.coordination, &child.id().node_path()).await;
        }
        host.shutdown_agent().await;
        destroy_queue_pair(&shared.coordination, &host.id().node_path()).await;
    }

    let launchers: Vec<Arc<dyn HostLauncher>> = shared.launchers.read().clone();
    for launcher in launchers {
        launcher.close().await;
    }

    shared.coordination.teardown_namespace(&shared.id).await;
    shared.coordination.close().await;
    info!("✅ Cluster {} closed", shared.id);
}

async fn destroy_queue_pair(coordination: &Coordination, node_path: &str) {
    coordination
        .queue(queue_name(node_path, QueueDirection::Command))
        .destroy()
        .await;
    coordination
        .queue(queue_name(node_path, QueueDirection::Response))
        .destroy()
        .await;
}

fn distinct_hostnames(configuration: &ClusterConfiguration) -> Vec<String> {
    let mut hostnames = Vec::new();
    for array in configuration.node_arrays() {
        for node in array.nodes() {
            let hostname = sanitize(node.hostname());
            if !hostnames.contains(&hostname) {
                hostnames.push(hostname);
            }
        }
    }
    hostnames
}

fn generate_cluster_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("grid_{}", &uuid[..8])
}

//! # Cluster Configuration
//!
//! Programmatic, fluent configuration for a cluster run: which node arrays to
//! bring up, on which hosts, with which executable, and the timing knobs of
//! the health-check machinery. Configurations are plain values; validation
//! happens once when the `Cluster` consumes them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};
use crate::launcher::HostLauncher;

pub const DEFAULT_HEALTH_CHECK_DELAY_MS: u64 = 5_000;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SPAWN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HOST_LAUNCH_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

/// How the built-in launcher runs `localhost` host agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalLauncherMode {
    /// Host agent runs as a task inside the orchestrator process
    #[default]
    Thread,
    /// Host agent runs as a separate `gridtest-agent` process
    Process,
}

/// Executable a host agent runs to bring up a worker node.
///
/// With no explicit program the current executable is used, which works for
/// binaries that call [`crate::agent::main_if_agent`] at the top of `main`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ExecutableSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The program to spawn, defaulting to the currently running executable
    pub fn effective_program(&self) -> GridResult<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe()
                .map_err(|e| GridError::config(format!("cannot resolve current executable: {e}"))),
        }
    }
}

/// Timing knobs handed to spawned agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub health_check_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Disabled for agents sharing the orchestrator process, where a
    /// keepalive exit would take the orchestrator down with it
    pub keepalive_enabled: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            health_check_timeout_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            keepalive_enabled: true,
        }
    }
}

impl AgentSettings {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One worker node: logical id plus the hostname it runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfiguration {
    id: String,
    hostname: String,
}

impl NodeConfiguration {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// A named group of worker nodes, optionally overriding the cluster-wide
/// executable
#[derive(Debug, Clone)]
pub struct NodeArrayConfiguration {
    id: String,
    nodes: Vec<NodeConfiguration>,
    executable: Option<ExecutableSpec>,
}

impl NodeArrayConfiguration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            executable: None,
        }
    }

    pub fn node(mut self, node: NodeConfiguration) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_executable(mut self, executable: ExecutableSpec) -> Self {
        self.executable = Some(executable);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nodes(&self) -> &[NodeConfiguration] {
        &self.nodes
    }

    pub fn executable(&self) -> Option<&ExecutableSpec> {
        self.executable.as_ref()
    }
}

/// Top-level cluster configuration
#[derive(Clone)]
pub struct ClusterConfiguration {
    database_url: Option<String>,
    health_check_delay_ms: u64,
    health_check_timeout_ms: u64,
    spawn_timeout_ms: u64,
    host_launch_timeout_ms: u64,
    poll_interval_ms: u64,
    executable: ExecutableSpec,
    local_launcher_mode: LocalLauncherMode,
    remote_launcher: Option<Arc<dyn HostLauncher>>,
    node_arrays: Vec<NodeArrayConfiguration>,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            database_url: None,
            health_check_delay_ms: DEFAULT_HEALTH_CHECK_DELAY_MS,
            health_check_timeout_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
            spawn_timeout_ms: DEFAULT_SPAWN_TIMEOUT_MS,
            host_launch_timeout_ms: DEFAULT_HOST_LAUNCH_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            executable: ExecutableSpec::default(),
            local_launcher_mode: LocalLauncherMode::default(),
            remote_launcher: None,
            node_arrays: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ClusterConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfiguration")
            .field("database_url", &self.database_url.as_deref().map(|_| "***"))
            .field("health_check_delay_ms", &self.health_check_delay_ms)
            .field("health_check_timeout_ms", &self.health_check_timeout_ms)
            .field("spawn_timeout_ms", &self.spawn_timeout_ms)
            .field("host_launch_timeout_ms", &self.host_launch_timeout_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("local_launcher_mode", &self.local_launcher_mode)
            .field("has_remote_launcher", &self.remote_launcher.is_some())
            .field("node_arrays", &self.node_arrays.len())
            .finish()
    }
}

impl ClusterConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node array. Duplicate ids are rejected at validation time.
    pub fn node_array(mut self, array: NodeArrayConfiguration) -> Self {
        self.node_arrays.push(array);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_health_check_delay_ms(mut self, delay_ms: u64) -> Self {
        self.health_check_delay_ms = delay_ms;
        self
    }

    pub fn with_health_check_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.health_check_timeout_ms = timeout_ms;
        self
    }

    pub fn with_spawn_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.spawn_timeout_ms = timeout_ms;
        self
    }

    pub fn with_host_launch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.host_launch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_executable(mut self, executable: ExecutableSpec) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_local_launcher_mode(mut self, mode: LocalLauncherMode) -> Self {
        self.local_launcher_mode = mode;
        self
    }

    /// Launcher used for hosts other than `localhost` (SSH transports and the
    /// like implement [`HostLauncher`] outside this crate)
    pub fn with_remote_launcher(mut self, launcher: Arc<dyn HostLauncher>) -> Self {
        self.remote_launcher = Some(launcher);
        self
    }

    /// Resolve the backend URL: explicit setting first, then environment
    pub fn resolve_database_url(&self) -> GridResult<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        std::env::var("PGMQ_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| {
                GridError::config(
                    "no database URL: set one on the configuration or export \
                     PGMQ_DATABASE_URL / DATABASE_URL",
                )
            })
    }

    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn host_launch_timeout(&self) -> Duration {
        Duration::from_millis(self.host_launch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn health_check_timeout_ms(&self) -> u64 {
        self.health_check_timeout_ms
    }

    pub fn executable(&self) -> &ExecutableSpec {
        &self.executable
    }

    pub fn local_launcher_mode(&self) -> LocalLauncherMode {
        self.local_launcher_mode
    }

    pub fn remote_launcher(&self) -> Option<&Arc<dyn HostLauncher>> {
        self.remote_launcher.as_ref()
    }

    pub fn node_arrays(&self) -> &[NodeArrayConfiguration] {
        &self.node_arrays
    }

    /// Settings handed to a spawned agent
    pub fn agent_settings(&self, keepalive_enabled: bool) -> AgentSettings {
        AgentSettings {
            health_check_timeout_ms: self.health_check_timeout_ms,
            poll_interval_ms: self.poll_interval_ms,
            keepalive_enabled,
        }
    }

    /// Reject duplicate array ids, duplicate node ids within an array, and
    /// empty arrays
    pub fn validate(&self) -> GridResult<()> {
        for (i, array) in self.node_arrays.iter().enumerate() {
            if array.nodes().is_empty() {
                return Err(GridError::config(format!(
                    "node array '{}' has no nodes",
                    array.id()
                )));
            }
            if self.node_arrays[..i].iter().any(|a| a.id() == array.id()) {
                return Err(GridError::config(format!(
                    "duplicate node array id '{}'",
                    array.id()
                )));
            }
            for (j, node) in array.nodes().iter().enumerate() {
                if array.nodes()[..j].iter().any(|n| n.id() == node.id()) {
                    return Err(GridError::config(format!(
                        "duplicate node id '{}' in array '{}'",
                        node.id(),
                        array.id()
                    )));
                }
            }
        }
        Ok(())
    }
}

//! # Host Launchers
//!
//! Bringing up one host agent per distinct host in the cluster
//! configuration. The trait is the seam for transports: the two launchers
//! here serve "localhost" only, either as a task inside the orchestrator
//! process or as a separate agent process. A remote transport (SSH or
//! otherwise) plugs in through the same trait and may rewrite the connect
//! string it hands back, e.g. for port forwarding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::{self, AgentConfig, AgentHandle};
use crate::config::{AgentSettings, ExecutableSpec};
use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::jobs::JobRegistry;
use crate::process::{self, NodeProcess, ProcessRef};

/// Bounded wait for an in-process agent to drain on close.
const THREAD_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HostLauncher: Send + Sync + std::fmt::Debug {
    /// Bring up the host agent for `host_id`. Returns the connect string the
    /// agent's children must use, which may differ from the one passed in
    /// when the transport rewrites it.
    async fn launch(&self, host_id: &GlobalNodeId, connect_string: &str) -> GridResult<String>;

    /// Terminate everything this launcher brought up. Best-effort, never
    /// raises.
    async fn close(&self);
}

fn require_local_host(host_id: &GlobalNodeId) -> GridResult<()> {
    if !host_id.is_host() {
        return Err(GridError::config(format!(
            "launcher needs a host-level id, got node '{host_id}'"
        )));
    }
    if host_id.hostname() != "localhost" {
        return Err(GridError::config(format!(
            "local launcher only serves localhost, got '{}'",
            host_id.hostname()
        )));
    }
    Ok(())
}

/// Runs the host agent as a task inside the calling process. The keepalive
/// watchdog is forced off: a watchdog exit here would kill the orchestrator.
#[derive(Debug)]
pub struct LocalThreadLauncher {
    settings: AgentSettings,
    registry: Arc<JobRegistry>,
    launched: parking_lot::Mutex<Option<AgentHandle>>,
}

impl LocalThreadLauncher {
    pub fn new(mut settings: AgentSettings) -> Self {
        settings.keepalive_enabled = false;
        Self {
            settings,
            registry: Arc::new(JobRegistry::with_builtins()),
            launched: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl HostLauncher for LocalThreadLauncher {
    async fn launch(&self, host_id: &GlobalNodeId, connect_string: &str) -> GridResult<String> {
        require_local_host(host_id)?;

        let mut slot = self.launched.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(GridError::init(format!(
                "thread launcher already serves {}, one host per launcher",
                existing.node_id()
            )));
        }

        info!("🧵 Launching in-process host agent for {host_id}");
        let handle = agent::spawn_in_process(
            AgentConfig {
                node_id: host_id.clone(),
                connect_string: connect_string.to_string(),
                settings: self.settings.clone(),
            },
            Arc::clone(&self.registry),
        );
        *slot = Some(handle);
        Ok(connect_string.to_string())
    }

    async fn close(&self) {
        let handle = self.launched.lock().take();
        if let Some(handle) = handle {
            let host_id = handle.node_id().clone();
            if let Err(e) = handle.shutdown(THREAD_CLOSE_TIMEOUT).await {
                warn!("In-process host agent for {host_id} closed with error: {e}");
            }
            process::remove_scratch(&host_id);
        }
    }
}

/// Spawns the agent binary as a separate localhost process per host. The
/// spawned agent keeps its keepalive watchdog, it has its own process to
/// protect.
#[derive(Debug)]
pub struct LocalProcessLauncher {
    executable: ExecutableSpec,
    settings: AgentSettings,
    launched: parking_lot::Mutex<Vec<(GlobalNodeId, ProcessRef)>>,
}

impl LocalProcessLauncher {
    pub fn new(executable: ExecutableSpec, settings: AgentSettings) -> Self {
        Self {
            executable,
            settings,
            launched: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostLauncher for LocalProcessLauncher {
    async fn launch(&self, host_id: &GlobalNodeId, connect_string: &str) -> GridResult<String> {
        require_local_host(host_id)?;
        if self.launched.lock().iter().any(|(id, _)| id == host_id) {
            return Err(GridError::init(format!(
                "host agent for {host_id} is already running"
            )));
        }

        let (program, args) =
            agent::agent_invocation(&self.executable, host_id, connect_string, &self.settings)?;
        let working_dir = process::scratch_dir(host_id)?;

        info!("🚀 Launching host agent process for {host_id}");
        let spawned = NodeProcess::spawn(
            &host_id.node_path(),
            &program,
            &args,
            &self.executable.env,
            &working_dir,
        )
        .await?;
        self.launched
            .lock()
            .push((host_id.clone(), spawned.reference()));
        Ok(connect_string.to_string())
    }

    async fn close(&self) {
        let launched: Vec<(GlobalNodeId, ProcessRef)> =
            self.launched.lock().drain(..).collect();
        for (host_id, reference) in launched {
            reference.destroy().await;
            process::remove_scratch(&host_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_thread_launcher_rejects_node_level_id() {
        let launcher = LocalThreadLauncher::new(AgentSettings::default());
        let node = GlobalNodeId::node("c", "localhost", "arr", "n0");
        let err = launcher.launch(&node, "postgresql://x").await.unwrap_err();
        assert!(matches!(err, GridError::Config { .. }));
    }

    #[tokio::test]
    async fn test_local_launchers_reject_remote_hostnames() {
        let host = GlobalNodeId::host("c", "db.internal");

        let thread = LocalThreadLauncher::new(AgentSettings::default());
        assert!(thread.launch(&host, "postgresql://x").await.is_err());

        let process =
            LocalProcessLauncher::new(ExecutableSpec::default(), AgentSettings::default());
        assert!(process.launch(&host, "postgresql://x").await.is_err());
    }

    #[tokio::test]
    async fn test_process_launcher_rejects_duplicate_host() {
        let launcher =
            LocalProcessLauncher::new(ExecutableSpec::default(), AgentSettings::default());
        let host = GlobalNodeId::host("c", "localhost");
        launcher
            .launched
            .lock()
            .push((host.clone(), ProcessRef::new(1)));

        let err = launcher.launch(&host, "postgresql://x").await.unwrap_err();
        assert!(matches!(err, GridError::Init { .. }));
    }

    #[test]
    fn test_thread_launcher_disables_keepalive() {
        let launcher = LocalThreadLauncher::new(AgentSettings {
            keepalive_enabled: true,
            ..AgentSettings::default()
        });
        assert!(!launcher.settings.keepalive_enabled);
    }
}

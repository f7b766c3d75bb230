//! # Agent Runtime
//!
//! The shared serving loop behind both agent roles. A host agent and a
//! worker node run the same runtime: connect to the coordination backend,
//! bind an RPC server on the agent's own queue pair, and serve commands
//! until told to stop. Role is implied by identity: host-level ids get
//! supervision commands, node-level ids get jobs.
//!
//! Worker agents also arm the keepalive watchdog, which hard-exits the
//! process when no command has arrived within the health-check timeout, so
//! workers never outlive a crashed or unreachable orchestrator. In-process
//! agents run with the watchdog disabled, a hard exit there would take the
//! orchestrator down with it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{
    AgentSettings, DEFAULT_HEALTH_CHECK_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
};
use crate::coordination::Coordination;
use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::jobs::JobRegistry;
use crate::rpc::{CommandContext, RpcServer};
use crate::tools::ClusterTools;

/// Everything needed to bring up one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: GlobalNodeId,
    pub connect_string: String,
    pub settings: AgentSettings,
}

/// Command line of the `gridtest-agent` binary.
#[derive(Debug, Parser)]
#[command(name = "gridtest-agent", version, about = "Host/worker agent for gridtest clusters")]
pub struct AgentArgs {
    /// Node path served by this agent: "{cluster}/{host}" for a host agent,
    /// "{cluster}/{host}/{array}/{node}" for a worker
    #[arg(long)]
    pub node_path: String,

    /// Postgres connection string for the coordination backend
    #[arg(long)]
    pub connect: String,

    /// Self-terminate when no command arrives for this many milliseconds
    #[arg(long, default_value_t = DEFAULT_HEALTH_CHECK_TIMEOUT_MS)]
    pub health_check_timeout_ms: u64,

    /// Queue poll interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Disable the keepalive watchdog
    #[arg(long)]
    pub no_keepalive: bool,
}

impl AgentArgs {
    pub fn into_config(self) -> GridResult<AgentConfig> {
        Ok(AgentConfig {
            node_id: GlobalNodeId::parse(&self.node_path)?,
            connect_string: self.connect,
            settings: AgentSettings {
                health_check_timeout_ms: self.health_check_timeout_ms,
                poll_interval_ms: self.poll_interval_ms,
                keepalive_enabled: !self.no_keepalive,
            },
        })
    }
}

/// Argument vector for re-entering the agent binary as a spawned agent.
/// Kept in lockstep with [`AgentArgs`] by the round-trip test below.
pub fn node_agent_args(
    node_id: &GlobalNodeId,
    connect_string: &str,
    settings: &AgentSettings,
) -> Vec<String> {
    let mut args = vec![
        "--node-path".to_string(),
        node_id.node_path(),
        "--connect".to_string(),
        connect_string.to_string(),
        "--health-check-timeout-ms".to_string(),
        settings.health_check_timeout_ms.to_string(),
        "--poll-interval-ms".to_string(),
        settings.poll_interval_ms.to_string(),
    ];
    if !settings.keepalive_enabled {
        args.push("--no-keepalive".to_string());
    }
    args
}

/// Resolve the full command line (program + args) that re-enters
/// `executable` as the agent for `node_id`. The executable's own args come
/// first, so wrapper invocations keep working.
pub fn agent_invocation(
    executable: &crate::config::ExecutableSpec,
    node_id: &GlobalNodeId,
    connect_string: &str,
    settings: &AgentSettings,
) -> GridResult<(std::path::PathBuf, Vec<String>)> {
    let program = executable.effective_program()?;
    let mut args = executable.args.clone();
    args.extend(node_agent_args(node_id, connect_string, settings));
    Ok((program, args))
}

/// Run an agent with the built-in job vocabulary until signalled or served a
/// terminal command.
pub async fn run_agent(config: AgentConfig, shutdown: broadcast::Receiver<()>) -> GridResult<()> {
    run_agent_with(config, Arc::new(JobRegistry::with_builtins()), shutdown).await
}

/// Like [`run_agent`] with a caller-supplied job registry.
pub async fn run_agent_with(
    config: AgentConfig,
    registry: Arc<JobRegistry>,
    shutdown: broadcast::Receiver<()>,
) -> GridResult<()> {
    info!(
        "🚀 Agent starting for {} (keepalive {})",
        config.node_id,
        if config.settings.keepalive_enabled {
            "on"
        } else {
            "off"
        }
    );

    let coordination =
        Coordination::connect(&config.connect_string, config.settings.poll_interval()).await?;
    let tools = ClusterTools::new(coordination.clone(), config.node_id.clone());
    let context = CommandContext::new(config.node_id.clone(), tools, registry);
    let server = RpcServer::bind(&coordination, &config.node_id, context).await?;

    if config.settings.keepalive_enabled {
        spawn_keepalive(
            server.last_command_handle(),
            &config.settings,
            config.node_id.node_path(),
        );
    } else {
        debug!("Keepalive watchdog disabled for {}", config.node_id);
    }

    let result = server.run(shutdown).await;
    coordination.close().await;
    info!("Agent for {} stopped", config.node_id);
    result
}

/// Run an agent until it exits on its own, wiring Ctrl-C to a clean
/// shutdown. The shutdown sender outlives the serving loop on purpose:
/// dropping every sender reads as a stop signal to the loop.
pub async fn run_agent_to_completion(config: AgentConfig) -> GridResult<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Interrupt received, stopping agent");
            let _ = signal_tx.send(());
        }
    });

    let result = run_agent(config, shutdown_rx).await;
    drop(shutdown_tx);
    result
}

/// Call this first thing in `main` of any binary meant to serve as a
/// cluster executable, before starting an async runtime. When the process
/// was invoked as an agent (recognized by `--node-path` among the
/// arguments) this serves the agent loop and exits instead of returning;
/// otherwise it returns immediately and `main` continues as the user's own
/// program.
pub fn main_if_agent() {
    let args: Vec<String> = std::env::args().collect();
    if !args.iter().any(|arg| arg == "--node-path") {
        return;
    }
    crate::logging::init_logging();

    let config = AgentArgs::try_parse_from(&args)
        .map_err(|e| GridError::config(e.to_string()))
        .and_then(|args| args.into_config());
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("💥 Invalid agent invocation: {e}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("💥 Failed to start agent runtime: {e}");
            std::process::exit(2);
        }
    };
    match runtime.block_on(run_agent_to_completion(config)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("💥 Agent failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Watchdog task: hard-exit the process when the serving loop has been idle
/// past the configured timeout.
fn spawn_keepalive(
    last_command: Arc<parking_lot::Mutex<Instant>>,
    settings: &AgentSettings,
    node_path: String,
) {
    let timeout = settings.health_check_timeout();
    let poll = keepalive_poll(settings.health_check_timeout_ms);
    info!("⏱️ Keepalive watchdog armed for {node_path}: limit {timeout:?}, poll {poll:?}");

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll).await;
            let idle = last_command.lock().elapsed();
            if idle > timeout {
                error!(
                    "💀 {node_path} saw no command for {idle:?} (limit {timeout:?}), \
                     assuming the orchestrator is gone"
                );
                std::process::exit(1);
            }
        }
    });
}

fn keepalive_poll(timeout_ms: u64) -> Duration {
    Duration::from_millis((timeout_ms / 10).clamp(50, 500))
}

/// Handle to an agent running inside the current process.
#[derive(Debug)]
pub struct AgentHandle {
    node_id: GlobalNodeId,
    shutdown_tx: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<GridResult<()>>,
}

impl AgentHandle {
    pub fn node_id(&self) -> &GlobalNodeId {
        &self.node_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the agent loop and wait for it to drain, aborting the task if
    /// it does not stop within `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) -> GridResult<()> {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GridError::internal(format!(
                "agent task for {} died: {e}",
                self.node_id
            ))),
            Err(_) => {
                warn!(
                    "Agent for {} did not stop within {timeout:?}, aborting its task",
                    self.node_id
                );
                self.task.abort();
                Ok(())
            }
        }
    }
}

/// Start an agent on the current runtime. Used by the thread-mode host
/// launcher; the keepalive watchdog should be disabled in the settings.
pub fn spawn_in_process(config: AgentConfig, registry: Arc<JobRegistry>) -> AgentHandle {
    let node_id = config.node_id.clone();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let task = tokio::spawn(run_agent_with(config, registry, shutdown_rx));
    AgentHandle {
        node_id,
        shutdown_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_args_round_trip() {
        let node_id = GlobalNodeId::node("c1", "localhost", "arr", "n0");
        let settings = AgentSettings {
            health_check_timeout_ms: 1_500,
            poll_interval_ms: 10,
            keepalive_enabled: true,
        };

        let mut argv = vec!["gridtest-agent".to_string()];
        argv.extend(node_agent_args(&node_id, "postgresql://localhost/grid", &settings));
        let config = AgentArgs::try_parse_from(argv)
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.node_id, node_id);
        assert_eq!(config.connect_string, "postgresql://localhost/grid");
        assert_eq!(config.settings.health_check_timeout_ms, 1_500);
        assert_eq!(config.settings.poll_interval_ms, 10);
        assert!(config.settings.keepalive_enabled);
    }

    #[test]
    fn test_no_keepalive_flag_round_trips() {
        let node_id = GlobalNodeId::host("c1", "localhost");
        let settings = AgentSettings {
            keepalive_enabled: false,
            ..AgentSettings::default()
        };

        let mut argv = vec!["gridtest-agent".to_string()];
        argv.extend(node_agent_args(&node_id, "postgresql://localhost/grid", &settings));
        let config = AgentArgs::try_parse_from(argv)
            .unwrap()
            .into_config()
            .unwrap();

        assert!(!config.settings.keepalive_enabled);
        assert!(config.node_id.is_host());
    }

    #[test]
    fn test_main_if_agent_ignores_non_agent_invocations() {
        // The test binary carries no --node-path, so this must fall through.
        main_if_agent();
    }

    #[test]
    fn test_keepalive_poll_is_bounded() {
        assert_eq!(keepalive_poll(30_000), Duration::from_millis(500));
        assert_eq!(keepalive_poll(1_000), Duration::from_millis(100));
        assert_eq!(keepalive_poll(100), Duration::from_millis(50));
    }
}

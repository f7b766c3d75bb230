//! # Process Supervision
//!
//! Spawns worker processes and supervises them by PID rather than by the
//! in-memory child handle. A `ProcessRef` is just the PID and is serializable,
//! so it can travel inside `KillNode`/`CheckNode` commands and be acted on by
//! an agent that never held the original handle.
//!
//! Spawned stdio is piped, not inherited: a copier task tees each stream into
//! the agent's log, line by line, tagged with the owning node path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;

/// Bounded wait after a graceful termination request.
const GRACEFUL_WAIT: Duration = Duration::from_secs(10);
/// Bounded wait after escalating to a forced kill.
const FORCEFUL_WAIT: Duration = Duration::from_secs(5);
/// Liveness poll interval while waiting for a process to go away.
const REAP_POLL: Duration = Duration::from_millis(100);

/// Serializable handle to one OS process, valid beyond the lifetime of the
/// spawning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: u32,
}

impl ProcessRef {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// True iff the OS reports a live (non-zombie) process for this PID.
    pub fn is_alive(&self) -> bool {
        let pid = Pid::from_u32(self.pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        match system.process(pid) {
            Some(process) => process.status() != ProcessStatus::Zombie,
            None => false,
        }
    }

    fn signal(&self, signal: Signal) -> bool {
        let pid = Pid::from_u32(self.pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        match system.process(pid) {
            Some(process) => process.kill_with(signal).unwrap_or(false),
            None => false,
        }
    }

    /// Terminate the process: graceful request first, bounded wait, then a
    /// forced kill with another bounded wait. Best-effort: failures are
    /// logged, never raised, so teardown can proceed past dead processes.
    pub async fn destroy(&self) {
        if !self.is_alive() {
            debug!("Process {} already gone", self.pid);
            return;
        }

        info!("🗑️ Terminating process {}", self.pid);
        self.signal(Signal::Term);
        if self.wait_gone(GRACEFUL_WAIT).await {
            return;
        }

        warn!(
            "Process {} survived graceful termination, killing it",
            self.pid
        );
        self.signal(Signal::Kill);
        if !self.wait_gone(FORCEFUL_WAIT).await {
            warn!("Process {} could not be killed", self.pid);
        }
    }

    /// Poll until the process is gone or `timeout` elapses. Returns true if
    /// it went away.
    async fn wait_gone(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                return true;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        !self.is_alive()
    }
}

/// Spawn-side owner of one worker process.
#[derive(Debug)]
pub struct NodeProcess {
    node_path: String,
    reference: ProcessRef,
}

impl NodeProcess {
    /// Spawn `program` with piped stdio, tee both streams into the log, and
    /// detach a reaper that collects the exit status.
    pub async fn spawn(
        node_path: &str,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
        working_dir: &Path,
    ) -> GridResult<NodeProcess> {
        std::fs::create_dir_all(working_dir)?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                GridError::spawn(node_path, format!("failed to start {program:?}: {e}"))
            })?;

        let pid = child.id().ok_or_else(|| {
            GridError::spawn(node_path, "process exited before a PID was visible")
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_stream_copier(stdout, format!("{node_path}:out"));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stream_copier(stderr, format!("{node_path}:err"));
        }

        let reap_path = node_path.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Process for {reap_path} exited with {status}"),
                Err(e) => debug!("Failed to collect exit status for {reap_path}: {e}"),
            }
        });

        info!("🚀 Spawned process {pid} for {node_path}");
        Ok(NodeProcess {
            node_path: node_path.to_string(),
            reference: ProcessRef::new(pid),
        })
    }

    pub fn reference(&self) -> ProcessRef {
        self.reference
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    pub fn is_alive(&self) -> bool {
        self.reference.is_alive()
    }

    pub async fn close(&self) {
        self.reference.destroy().await;
    }
}

/// Tee one piped stream into the log, one line at a time. Read errors are
/// expected at process death and only logged at debug.
fn spawn_stream_copier<R>(stream: R, tag: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!("[{tag}] {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!("[{tag}] stream closed: {e}");
                    break;
                }
            }
        }
    });
}

fn scratch_base() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".gridtest")
}

/// Scratch directory for a node, without creating it.
pub fn scratch_root(id: &GlobalNodeId) -> PathBuf {
    scratch_base().join(id.node_path())
}

/// Create (if needed) and return a node's scratch directory.
pub fn scratch_dir(id: &GlobalNodeId) -> GridResult<PathBuf> {
    let dir = scratch_root(id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Best-effort removal of a node's scratch directory and everything under it.
pub fn remove_scratch(id: &GlobalNodeId) {
    let dir = scratch_root(id);
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Failed to remove scratch dir {dir:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let me = ProcessRef::new(std::process::id());
        assert!(me.is_alive());
    }

    #[test]
    fn test_nonexistent_pid_is_dead() {
        // PIDs near the default pid_max are effectively never in use on test
        // machines.
        let ghost = ProcessRef::new(4_000_000);
        assert!(!ghost.is_alive());
    }

    #[test]
    fn test_reference_wire_shape() {
        let reference = ProcessRef::new(1234);
        let wire = serde_json::to_value(reference).unwrap();
        assert_eq!(wire, serde_json::json!({"pid": 1234}));
    }

    #[tokio::test]
    async fn test_destroy_terminates_spawned_process() {
        let workdir = tempfile::tempdir().unwrap();
        let process = NodeProcess::spawn(
            "unit/localhost/a/n0",
            Path::new("sh"),
            &["-c".to_string(), "sleep 30".to_string()],
            &[],
            workdir.path(),
        )
        .await
        .unwrap();

        assert!(process.is_alive());
        process.close().await;
        assert!(!process.is_alive());
    }

    #[test]
    fn test_scratch_root_is_namespaced() {
        let id = GlobalNodeId::node("c1", "localhost", "arr", "n0");
        let root = scratch_root(&id);
        assert!(root.ends_with(".gridtest/c1/localhost/arr/n0"));
    }
}

//! # RPC Commands
//!
//! The closed command vocabulary of the RPC protocol. Host agents serve the
//! supervision commands (`SpawnNode`, `KillNode`, `CheckNode` with a process
//! reference); worker nodes serve `ExecuteNodeJob` and answer bare
//! `CheckNode` pings. `Shutdown` and `Abort` end a server loop and are
//! intercepted there, never dispatched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{AgentSettings, ExecutableSpec};
use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::jobs::{JobContext, JobRegistry, NodeJob};
use crate::process::{self, NodeProcess, ProcessRef};
use crate::tools::ClusterTools;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Spawn a worker process for `node_id` on the receiving host. The
    /// response carries the child's `ProcessRef`.
    SpawnNode {
        node_id: GlobalNodeId,
        executable: ExecutableSpec,
        connect_string: String,
        settings: AgentSettings,
    },
    /// Terminate the referenced process, graceful then forced.
    KillNode { process: ProcessRef },
    /// Liveness probe. With a process reference the receiving host verifies
    /// its child by PID; without one the receiver itself answering is the
    /// proof of life (and refreshes its keepalive timestamp).
    CheckNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process: Option<ProcessRef>,
    },
    /// Run a job from the receiver's registry.
    ExecuteNodeJob { job: NodeJob },
    /// Stop the receiving server loop after acknowledging.
    Shutdown,
    /// Internal sentinel: stop the receiving server loop without a response.
    Abort,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SpawnNode { .. } => "spawn_node",
            Command::KillNode { .. } => "kill_node",
            Command::CheckNode { .. } => "check_node",
            Command::ExecuteNodeJob { .. } => "execute_node_job",
            Command::Shutdown => "shutdown",
            Command::Abort => "abort",
        }
    }

    /// Execute against the receiving agent's context. Every failure is
    /// returned, not raised past the dispatch task, so the server can ship
    /// it back as the response error.
    pub async fn execute(self, context: &CommandContext) -> GridResult<Value> {
        match self {
            Command::SpawnNode {
                node_id,
                executable,
                connect_string,
                settings,
            } => {
                let (program, args) = crate::agent::agent_invocation(
                    &executable,
                    &node_id,
                    &connect_string,
                    &settings,
                )?;
                let working_dir = process::scratch_dir(&node_id)?;

                let spawned = NodeProcess::spawn(
                    &node_id.node_path(),
                    &program,
                    &args,
                    &executable.env,
                    &working_dir,
                )
                .await?;
                Ok(serde_json::to_value(spawned.reference())?)
            }

            Command::KillNode { process } => {
                process.destroy().await;
                Ok(Value::Null)
            }

            Command::CheckNode { process } => match process {
                Some(reference) => {
                    if reference.is_alive() {
                        Ok(json!(true))
                    } else {
                        Err(GridError::ProcessDead {
                            pid: reference.pid,
                        })
                    }
                }
                None => Ok(json!(true)),
            },

            Command::ExecuteNodeJob { job } => {
                let job_context = JobContext {
                    node_id: context.node_id.clone(),
                    tools: context.tools.clone(),
                };
                context.registry.run(job, job_context).await
            }

            Command::Shutdown => {
                info!("Shutdown acknowledged by {}", context.node_id);
                Ok(Value::Null)
            }

            Command::Abort => Err(GridError::internal(
                "abort is a loop sentinel and is never dispatched",
            )),
        }
    }
}

/// What an agent's server loop hands to command execution.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub node_id: GlobalNodeId,
    pub tools: ClusterTools,
    pub registry: Arc<JobRegistry>,
}

impl CommandContext {
    pub fn new(node_id: GlobalNodeId, tools: ClusterTools, registry: Arc<JobRegistry>) -> Self {
        Self {
            node_id,
            tools,
            registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags_are_snake_case() {
        let wire = serde_json::to_value(Command::Shutdown).unwrap();
        assert_eq!(wire, json!({"type": "shutdown"}));

        let wire = serde_json::to_value(Command::KillNode {
            process: ProcessRef::new(7),
        })
        .unwrap();
        assert_eq!(wire, json!({"type": "kill_node", "process": {"pid": 7}}));
    }

    #[test]
    fn test_bare_check_node_omits_process() {
        let wire = serde_json::to_value(Command::CheckNode { process: None }).unwrap();
        assert_eq!(wire, json!({"type": "check_node"}));

        let parsed: Command = serde_json::from_value(json!({"type": "check_node"})).unwrap();
        assert!(matches!(parsed, Command::CheckNode { process: None }));
    }

    #[test]
    fn test_spawn_node_round_trips_settings() {
        let command = Command::SpawnNode {
            node_id: GlobalNodeId::node("c", "localhost", "arr", "n0"),
            executable: ExecutableSpec::default(),
            connect_string: "postgresql://localhost/grid".to_string(),
            settings: AgentSettings::default(),
        };
        let wire = serde_json::to_value(&command).unwrap();
        assert_eq!(wire["type"], "spawn_node");
        let parsed: Command = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.name(), "spawn_node");
    }
}

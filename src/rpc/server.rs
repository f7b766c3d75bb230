//! # RPC Server
//!
//! Serving side of a node's RPC channel: one blocking take loop on the
//! command queue. Requests are received in FIFO order but dispatched to their
//! own tasks, so a slow job never blocks receipt of the next command and
//! completions may ship out of order.
//!
//! Every taken request refreshes the last-command timestamp the keepalive
//! watchdog reads. `Abort` ends the loop silently, `Shutdown` ends it after
//! acknowledging, and a malformed queue entry is fatal to the loop by design:
//! queue corruption never happens in normal operation and cannot be safely
//! skipped.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordination::{queue_name, Coordination, MessageQueue, QueueDirection};
use crate::error::GridResult;
use crate::identity::GlobalNodeId;
use crate::rpc::command::{Command, CommandContext};
use crate::rpc::message::{Request, Response, ABORT_REQUEST_ID};

pub struct RpcServer {
    node_path: String,
    command_queue: MessageQueue,
    response_queue: MessageQueue,
    last_command: Arc<parking_lot::Mutex<Instant>>,
    context: CommandContext,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("node_path", &self.node_path)
            .finish()
    }
}

impl RpcServer {
    /// Bind the server to `id`'s command/response queues, creating them if
    /// needed.
    pub async fn bind(
        coordination: &Coordination,
        id: &GlobalNodeId,
        context: CommandContext,
    ) -> GridResult<Self> {
        let node_path = id.node_path();
        let command_queue = coordination.queue(queue_name(&node_path, QueueDirection::Command));
        command_queue.ensure().await?;
        let response_queue = coordination.queue(queue_name(&node_path, QueueDirection::Response));
        response_queue.ensure().await?;

        Ok(Self {
            node_path,
            command_queue,
            response_queue,
            last_command: Arc::new(parking_lot::Mutex::new(Instant::now())),
            context,
        })
    }

    /// Timestamp of the most recently taken command, shared with the
    /// keepalive watchdog.
    pub fn last_command_handle(&self) -> Arc<parking_lot::Mutex<Instant>> {
        Arc::clone(&self.last_command)
    }

    /// Serve until aborted, shut down, or signalled. Returns `Err` only on a
    /// fatal channel condition (unreachable backend, corrupt queue entry).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> GridResult<()> {
        info!("🚀 RPC server listening for {}", self.node_path);

        loop {
            let Some(value) = self.command_queue.take(&mut shutdown).await? else {
                info!("RPC server for {} signalled to stop", self.node_path);
                break;
            };
            *self.last_command.lock() = Instant::now();

            let request: Request = serde_json::from_value(value)?;
            debug!(
                "📥 Request {} #{} on {} (queued {} ms)",
                request.command.name(),
                request.id,
                self.node_path,
                request.queued_for_ms()
            );

            match request.command {
                Command::Abort => {
                    info!("RPC server for {} aborted", self.node_path);
                    break;
                }
                Command::Shutdown => {
                    let response = Response::ok(request.id, serde_json::Value::Null);
                    if let Err(e) = self.response_queue.offer(&response).await {
                        warn!(
                            "Failed to acknowledge shutdown on {}: {e}",
                            self.node_path
                        );
                    }
                    info!("RPC server for {} shut down", self.node_path);
                    break;
                }
                command => self.dispatch(request.id, command),
            }
        }

        Ok(())
    }

    /// Run one command on its own task and ship exactly one response back.
    /// Failures to push the response are logged, not retried: the backend is
    /// assumed to be going away in that case.
    fn dispatch(&self, id: u64, command: Command) {
        let context = self.context.clone();
        let response_queue = self.response_queue.clone();
        let node_path = self.node_path.clone();

        tokio::spawn(async move {
            let name = command.name();
            let response = match command.execute(&context).await {
                Ok(result) => Response::ok(id, result),
                Err(e) => {
                    debug!("Command {name} #{id} on {node_path} failed: {e}");
                    Response::failure(id, e.to_string())
                }
            };
            if let Err(e) = response_queue.offer(&response).await {
                warn!("Failed to push response #{id} from {node_path}: {e}");
            }
        });
    }

    /// Stop a running server from outside its loop by enqueueing the abort
    /// sentinel, bypassing id allocation.
    pub async fn close(&self) {
        let abort = Request::new(ABORT_REQUEST_ID, Command::Abort);
        if let Err(e) = self.command_queue.offer(&abort).await {
            debug!("Failed to enqueue abort for {}: {e}", self.node_path);
        }
    }
}

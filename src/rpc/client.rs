//! # RPC Client
//!
//! Caller side of a node's RPC channel. `call_async` allocates the next
//! request id, registers a pending slot, and pushes onto the node's command
//! queue; a dedicated receiver task drains the response queue and resolves
//! pending slots by id. Responses may arrive in any order, correlation is by
//! id only.
//!
//! A closed client never hangs callers: closing fails every outstanding call,
//! and calls made after close resolve immediately as channel-closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::coordination::{queue_name, Coordination, MessageQueue, QueueDirection};
use crate::error::{GridError, GridResult};
use crate::identity::GlobalNodeId;
use crate::rpc::message::{Request, Response};
use crate::rpc::Command;

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Response>>>;

pub struct RpcClient {
    node_path: String,
    command_queue: MessageQueue,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    receiver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("node_path", &self.node_path)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RpcClient {
    /// Open the channel to `target`: ensure both queues exist and start the
    /// response receiver.
    pub async fn connect(coordination: &Coordination, target: &GlobalNodeId) -> GridResult<Self> {
        let node_path = target.node_path();
        let command_queue =
            coordination.queue(queue_name(&node_path, QueueDirection::Command));
        command_queue.ensure().await?;
        let response_queue =
            coordination.queue(queue_name(&node_path, QueueDirection::Response));
        response_queue.ensure().await?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let receiver = tokio::spawn(receiver_loop(
            response_queue,
            Arc::clone(&pending),
            Arc::clone(&closed),
            shutdown_rx,
            node_path.clone(),
        ));

        debug!("🔌 RPC client connected to {node_path}");
        Ok(Self {
            node_path,
            command_queue,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            shutdown_tx,
            receiver: parking_lot::Mutex::new(Some(receiver)),
        })
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue `command` and return a handle to its eventual response. Never
    /// raises: enqueue failures (and calls on a closed client) come back as
    /// an already-failed handle.
    pub async fn call_async(&self, command: Command) -> PendingCall {
        if self.is_closed() {
            return PendingCall::failed(
                self.node_path.clone(),
                GridError::channel_closed(&self.node_path),
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);

        let request = Request::new(id, command);
        debug!(
            "📤 Sending {} #{id} to {}",
            request.command.name(),
            self.node_path
        );
        if let Err(e) = self.command_queue.offer(&request).await {
            self.pending.remove(&id);
            return PendingCall::failed(self.node_path.clone(), e);
        }

        PendingCall::waiting(self.node_path.clone(), id, receiver)
    }

    pub async fn call(&self, command: Command) -> GridResult<serde_json::Value> {
        self.call_async(command).await.wait().await
    }

    pub async fn call_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> GridResult<serde_json::Value> {
        self.call_async(command).await.wait_timeout(timeout).await
    }

    /// Close the channel: stop the receiver and fail every outstanding call.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing RPC client for {}", self.node_path);
        let _ = self.shutdown_tx.send(());

        let receiver = self.receiver.lock().take();
        if let Some(handle) = receiver {
            let _ = handle.await;
        }
        fail_outstanding(&self.pending, &self.node_path);
    }
}

async fn receiver_loop(
    response_queue: MessageQueue,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
    node_path: String,
) {
    loop {
        match response_queue.take(&mut shutdown).await {
            Ok(Some(value)) => match serde_json::from_value::<Response>(value) {
                Ok(response) => match pending.remove(&response.id) {
                    Some((_, slot)) => {
                        debug!("📥 Response #{} from {node_path}", response.id);
                        // A dropped slot just means the caller stopped waiting.
                        let _ = slot.send(response);
                    }
                    None => {
                        warn!(
                            "Dropping response with unknown id {} from {node_path}",
                            response.id
                        );
                    }
                },
                Err(e) => warn!("Dropping malformed response from {node_path}: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                error!("💥 Response channel for {node_path} failed: {e}");
                closed.store(true, Ordering::SeqCst);
                fail_outstanding(&pending, &node_path);
                break;
            }
        }
    }
}

fn fail_outstanding(pending: &DashMap<u64, oneshot::Sender<Response>>, node_path: &str) {
    let outstanding = pending.len();
    if outstanding > 0 {
        warn!("Failing {outstanding} outstanding calls to {node_path}");
    }
    // Dropping the senders resolves the receivers as channel-closed.
    pending.clear();
}

/// Handle to one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    node_path: String,
    id: u64,
    state: CallState,
}

#[derive(Debug)]
enum CallState {
    Waiting(oneshot::Receiver<Response>),
    Failed(GridError),
}

impl PendingCall {
    fn waiting(node_path: String, id: u64, receiver: oneshot::Receiver<Response>) -> Self {
        Self {
            node_path,
            id,
            state: CallState::Waiting(receiver),
        }
    }

    fn failed(node_path: String, error: GridError) -> Self {
        Self {
            node_path,
            id: 0,
            state: CallState::Failed(error),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    /// Wait for the response without a deadline.
    pub async fn wait(self) -> GridResult<serde_json::Value> {
        match self.state {
            CallState::Failed(error) => Err(error),
            CallState::Waiting(receiver) => match receiver.await {
                Ok(response) => response.into_result(&self.node_path),
                Err(_) => Err(GridError::channel_closed(&self.node_path)),
            },
        }
    }

    /// Wait for the response, raising a timeout-kind error past `timeout`.
    /// Timing out locally does not cancel the remote work.
    pub async fn wait_timeout(self, timeout: Duration) -> GridResult<serde_json::Value> {
        let timeout_ms = timeout.as_millis() as u64;
        match self.state {
            CallState::Failed(error) => Err(error),
            CallState::Waiting(receiver) => match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(response)) => response.into_result(&self.node_path),
                Ok(Err(_)) => Err(GridError::channel_closed(&self.node_path)),
                Err(_) => Err(GridError::timeout(
                    format!("rpc call to {}", self.node_path),
                    timeout_ms,
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_call_resolves_immediately() {
        let call = PendingCall::failed(
            "c/h".to_string(),
            GridError::channel_closed("c/h"),
        );
        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, GridError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_silent_channel_times_out() {
        let (_sender, receiver) = oneshot::channel();
        let call = PendingCall::waiting("c/h".to_string(), 5, receiver);
        let err = call
            .wait_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_dropped_slot_reads_as_channel_closed() {
        let (sender, receiver) = oneshot::channel::<Response>();
        drop(sender);
        let call = PendingCall::waiting("c/h".to_string(), 5, receiver);
        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, GridError::ChannelClosed { .. }));
    }

    #[test]
    fn test_waiting_call_stays_pending_until_resolved() {
        let (sender, receiver) = oneshot::channel();
        let call = PendingCall::waiting("c/h".to_string(), 9, receiver);

        let mut wait = tokio_test::task::spawn(call.wait());
        tokio_test::assert_pending!(wait.poll());

        sender
            .send(Response::ok(9, serde_json::json!("done")))
            .unwrap();
        let result = tokio_test::assert_ready!(wait.poll());
        assert_eq!(result.unwrap(), serde_json::json!("done"));
    }
}

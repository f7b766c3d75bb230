//! RPC protocol tests against a live backend: request/response correlation,
//! error propagation, and the ways a channel ends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use gridtest_core::coordination::{queue_name, Coordination, QueueDirection};
use gridtest_core::error::{GridError, GridResult};
use gridtest_core::identity::GlobalNodeId;
use gridtest_core::jobs::{JobRegistry, NodeJob};
use gridtest_core::rpc::{Command, CommandContext, RpcClient, RpcServer};
use gridtest_core::tools::ClusterTools;

struct Served {
    server: Arc<RpcServer>,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<GridResult<()>>,
}

impl Served {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Bind a server with the built-in job vocabulary for `node_id` and run it
/// on its own task.
async fn serve(coordination: &Coordination, node_id: &GlobalNodeId) -> Served {
    let tools = ClusterTools::new(coordination.clone(), node_id.clone());
    let context = CommandContext::new(
        node_id.clone(),
        tools,
        Arc::new(JobRegistry::with_builtins()),
    );
    let server = Arc::new(
        RpcServer::bind(coordination, node_id, context)
            .await
            .expect("failed to bind server"),
    );
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let run = Arc::clone(&server);
    let task = tokio::spawn(async move { run.run(shutdown_rx).await });
    Served {
        server,
        shutdown,
        task,
    }
}

fn execute(kind: &str, params: serde_json::Value) -> Command {
    Command::ExecuteNodeJob {
        job: NodeJob::with_params(kind, params),
    }
}

#[tokio::test]
async fn test_call_round_trips_through_queues() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    let result = client
        .call_timeout(execute("echo", json!({"n": 41})), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result["n"], 41);

    client.close().await;
    served.stop().await;
    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_responses_correlate_by_id_out_of_order() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    // The slow call is issued first but completes last; the fast response
    // must still land on the fast caller.
    let slow = client
        .call_async(execute("sleep_ms", json!({"ms": 600})))
        .await;
    let fast = client
        .call_async(execute("echo", json!({"tag": "fast"})))
        .await;
    assert_ne!(slow.id(), fast.id());

    let fast_result = fast.wait_timeout(Duration::from_secs(10)).await.unwrap();
    assert_eq!(fast_result["tag"], "fast");
    let slow_result = slow.wait_timeout(Duration::from_secs(10)).await.unwrap();
    assert_eq!(slow_result, serde_json::Value::Null);

    client.close().await;
    served.stop().await;
    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_job_failure_surfaces_as_remote_error() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    let err = client
        .call_timeout(
            execute("fail", json!({"message": "boom"})),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Remote { .. }));
    assert!(err.to_string().contains("boom"));

    client.close().await;
    served.stop().await;
    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_close_fails_outstanding_and_later_calls() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    let pending = client
        .call_async(execute("sleep_ms", json!({"ms": 2_000})))
        .await;
    client.close().await;

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, GridError::ChannelClosed { .. }));

    // Calls after close resolve immediately, no queue round trip.
    let err = client.call(execute("echo", json!({}))).await.unwrap_err();
    assert!(matches!(err, GridError::ChannelClosed { .. }));
    assert!(client.is_closed());

    served.stop().await;
    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_abort_stops_server_without_response() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;

    served.server.close().await;
    let result = tokio::time::timeout(Duration::from_secs(5), served.task)
        .await
        .expect("server did not stop on abort")
        .unwrap();
    assert!(result.is_ok());

    // Abort is silent: nothing lands on the response queue.
    let response = coordination
        .queue(queue_name(&node_id.node_path(), QueueDirection::Response))
        .try_take()
        .await
        .unwrap();
    assert!(response.is_none());

    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_shutdown_acknowledges_then_stops() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    let ack = client
        .call_timeout(Command::Shutdown, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ack, serde_json::Value::Null);

    let result = tokio::time::timeout(Duration::from_secs(5), served.task)
        .await
        .expect("server did not stop after shutdown")
        .unwrap();
    assert!(result.is_ok());

    client.close().await;
    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_malformed_queue_entry_is_fatal_to_the_server() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;

    coordination
        .queue(queue_name(&node_id.node_path(), QueueDirection::Command))
        .offer(&json!({"not": "a request"}))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), served.task)
        .await
        .expect("server did not stop on a corrupt entry")
        .unwrap();
    assert!(result.is_err());

    common::destroy_channel(&coordination, &node_id).await;
}

#[tokio::test]
async fn test_bare_check_node_is_answered_by_the_receiver() {
    let Some(coordination) = common::connect().await else {
        return;
    };
    let node_id = GlobalNodeId::node(common::unique_cluster_id("rpc"), "localhost", "arr", "0");
    let served = serve(&coordination, &node_id).await;
    let client = RpcClient::connect(&coordination, &node_id).await.unwrap();

    let alive = client
        .call_timeout(Command::CheckNode { process: None }, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(alive, json!(true));

    client.close().await;
    served.stop().await;
    common::destroy_channel(&coordination, &node_id).await;
}

//! End-to-end cluster lifecycle: bring up real worker processes, dispatch
//! jobs, rendezvous with them, and verify health-driven teardown.

mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use gridtest_core::cluster::{Cluster, ClusterState};
use gridtest_core::config::{
    ClusterConfiguration, LocalLauncherMode, NodeArrayConfiguration, NodeConfiguration,
};
use gridtest_core::error::GridError;
use gridtest_core::jobs::NodeJob;

fn two_worker_configuration(url: &str) -> ClusterConfiguration {
    common::test_configuration(url).node_array(
        NodeArrayConfiguration::new("workers")
            .node(NodeConfiguration::new("0", "localhost"))
            .node(NodeConfiguration::new("1", "localhost")),
    )
}

#[tokio::test]
async fn test_cluster_lifecycle_and_job_dispatch() {
    let Some(url) = common::database_url() else {
        return;
    };
    let cluster = Cluster::with_id(
        common::unique_cluster_id("basic"),
        two_worker_configuration(&url),
    )
    .await
    .expect("cluster failed to start");
    assert_eq!(cluster.state(), ClusterState::Running);

    let workers = cluster.node_array("workers").unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers.ids(), vec!["0", "1"]);

    let future = workers
        .execute_on_all(NodeJob::with_params("echo", json!({"ping": true})))
        .await;
    assert_eq!(future.len(), 2);
    for (id, result) in future.collect().await {
        let value = result.unwrap_or_else(|e| panic!("job on node {id} failed: {e}"));
        assert_eq!(value["ping"], true);
    }

    // Unknown node ids are rejected before anything is dispatched.
    let err = workers
        .execute_on("missing", NodeJob::new("echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::UnknownNode { .. }));

    cluster.close().await;
    assert_eq!(cluster.state(), ClusterState::Closed);
}

#[tokio::test]
async fn test_workers_and_orchestrator_rendezvous() {
    let Some(url) = common::database_url() else {
        return;
    };
    let cluster = Cluster::with_id(
        common::unique_cluster_id("rv"),
        two_worker_configuration(&url),
    )
    .await
    .expect("cluster failed to start");
    let workers = cluster.node_array("workers").unwrap();

    // Both workers and the orchestrator itself make up the three parties.
    let future = workers
        .execute_on_all(NodeJob::with_params(
            "rendezvous_count",
            json!({"barrier": "rv", "parties": 3, "counter": "done", "timeout_ms": 30_000}),
        ))
        .await;
    let mut barrier = cluster.tools().barrier("rv", 3).await.unwrap();
    let tools = cluster.tools().clone();

    let (results, my_index) = tokio::join!(future.collect(), async move {
        let index = barrier.wait_timeout(Duration::from_secs(30)).await.unwrap();
        let done = tools.atomic_counter("done", 0).await.unwrap();
        done.increment_and_get().await.unwrap();
        index
    });

    let mut indexes = vec![my_index];
    for (id, result) in results {
        let value = result.unwrap_or_else(|e| panic!("rendezvous on node {id} failed: {e}"));
        indexes.push(value["index"].as_i64().unwrap());
    }
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2]);

    // Every party incremented exactly once after the barrier.
    let done = cluster.tools().atomic_counter("done", 0).await.unwrap();
    assert_eq!(done.get().await.unwrap(), 3);

    cluster.close().await;
}

#[tokio::test]
async fn test_slow_job_times_out_locally_without_killing_anything() {
    let Some(url) = common::database_url() else {
        return;
    };
    let configuration = common::test_configuration(&url).node_array(
        NodeArrayConfiguration::new("workers").node(NodeConfiguration::new("0", "localhost")),
    );
    let cluster = Cluster::with_id(common::unique_cluster_id("slow"), configuration)
        .await
        .expect("cluster failed to start");
    let workers = cluster.node_array("workers").unwrap();

    let future = workers
        .execute_on_all(NodeJob::with_params("sleep_ms", json!({"ms": 10_000})))
        .await;
    let err = future
        .get_timeout(Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The timeout was local: the cluster is untouched and the node keeps
    // serving.
    assert_eq!(cluster.state(), ClusterState::Running);
    let echo = workers
        .execute_on("0", NodeJob::with_params("echo", json!({"alive": 1})))
        .await
        .unwrap();
    let value = echo.get_timeout(Duration::from_secs(10)).await;
    assert!(value.is_ok());

    cluster.close().await;
}

#[tokio::test]
async fn test_dead_worker_force_closes_the_cluster() {
    let Some(url) = common::database_url() else {
        return;
    };
    let configuration = two_worker_configuration(&url).with_health_check_delay_ms(500);
    let cluster = Cluster::with_id(common::unique_cluster_id("dead"), configuration)
        .await
        .expect("cluster failed to start");
    let workers = cluster.node_array("workers").unwrap();

    // The job kills the worker before a response can be written; the health
    // timer notices the dead PID and force-closes everything, which fails
    // the outstanding call.
    let future = workers
        .execute_on("0", NodeJob::with_params("process_exit", json!({"code": 3})))
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(60), future.get())
        .await
        .expect("call survived the force-close")
        .unwrap_err();
    assert!(!err.is_timeout(), "expected a channel failure, got {err}");

    let deadline = Instant::now() + Duration::from_secs(30);
    while cluster.state() != ClusterState::Closed && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(cluster.state(), ClusterState::Closed);

    // Dispatch against the closed cluster fails without a round trip.
    let future = workers.execute_on_all(NodeJob::new("echo")).await;
    let err = future.get().await.unwrap_err();
    assert!(matches!(err, GridError::ChannelClosed { .. }));

    // Closing again is a no-op.
    cluster.close().await;
    assert_eq!(cluster.state(), ClusterState::Closed);
}

#[tokio::test]
async fn test_process_mode_host_launcher() {
    let Some(url) = common::database_url() else {
        return;
    };
    let configuration = two_worker_configuration(&url)
        .with_local_launcher_mode(LocalLauncherMode::Process);
    let cluster = Cluster::with_id(common::unique_cluster_id("proc"), configuration)
        .await
        .expect("cluster failed to start");

    let workers = cluster.node_array("workers").unwrap();
    let future = workers
        .execute_on_all(NodeJob::with_params("echo", json!({"mode": "process"})))
        .await;
    for (id, result) in future.collect().await {
        let value = result.unwrap_or_else(|e| panic!("job on node {id} failed: {e}"));
        assert_eq!(value["mode"], "process");
    }

    cluster.close().await;
    assert_eq!(cluster.state(), ClusterState::Closed);
}

#[tokio::test]
async fn test_cluster_without_nodes_fails_to_start() {
    let Some(url) = common::database_url() else {
        return;
    };
    let err = Cluster::with_id(
        common::unique_cluster_id("empty"),
        common::test_configuration(&url),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GridError::Config { .. }));
}

//! Shared helpers for integration tests. Everything touching the
//! coordination backend is gated on `TEST_DATABASE_URL` and skips quietly
//! when it is unset.
#![allow(dead_code)]

use std::time::Duration;

use gridtest_core::config::{ClusterConfiguration, ExecutableSpec};
use gridtest_core::coordination::{queue_name, Coordination, QueueDirection};
use gridtest_core::identity::GlobalNodeId;

/// Backend URL gate. Tests bail out quietly without one.
pub fn database_url() -> Option<String> {
    match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            println!("Skipping integration test - no TEST_DATABASE_URL provided");
            None
        }
    }
}

pub async fn connect() -> Option<Coordination> {
    let url = database_url()?;
    Some(connect_to(&url).await)
}

pub async fn connect_to(url: &str) -> Coordination {
    Coordination::connect(url, Duration::from_millis(10))
        .await
        .expect("failed to connect to test backend")
}

/// Unique cluster id per test so parallel runs never share backend state.
pub fn unique_cluster_id(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &uuid[..12])
}

/// The bundled agent binary, used as the worker executable in cluster tests.
pub fn agent_executable() -> ExecutableSpec {
    ExecutableSpec::new().with_program(env!("CARGO_BIN_EXE_gridtest-agent"))
}

/// Cluster configuration against the test backend with tight polling.
pub fn test_configuration(url: &str) -> ClusterConfiguration {
    ClusterConfiguration::new()
        .with_database_url(url)
        .with_poll_interval_ms(10)
        .with_executable(agent_executable())
}

/// Drop both queues of an RPC channel brought up outside a `Cluster`, which
/// would otherwise outlive the test in the backend.
pub async fn destroy_channel(coordination: &Coordination, id: &GlobalNodeId) {
    let path = id.node_path();
    coordination
        .queue(queue_name(&path, QueueDirection::Command))
        .destroy()
        .await;
    coordination
        .queue(queue_name(&path, QueueDirection::Response))
        .destroy()
        .await;
}

#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Gridtest Core
//!
//! Distributed-test orchestration over a PostgreSQL coordination backend.
//!
//! ## Overview
//!
//! Gridtest brings up a disposable **cluster** of worker processes across one
//! or more machines, runs jobs on them over RPC, and tears everything down and
//! scrubs the backend when the run ends or anything in the tree dies. It is
//! built for integration and system tests that need many cooperating
//! processes: every moving part assumes the cluster is short-lived, so
//! failures anywhere force-close the whole thing instead of limping along.
//!
//! ## Architecture
//!
//! A three-level supervision tree, all talking through pgmq message queues in
//! PostgreSQL:
//!
//! - The **orchestrator** ([`Cluster`]) lives in the test process. It launches
//!   one host agent per distinct machine, asks each to spawn its worker
//!   nodes, and runs the health-check timer.
//! - A **host agent** spawns and supervises the worker processes on its
//!   machine. It answers liveness probes about its children by PID.
//! - A **worker node** serves jobs from its queue and runs the keepalive
//!   watchdog: a worker that hears nothing for the health-check timeout
//!   assumes the orchestrator is gone and exits.
//!
//! Workers coordinate with each other and with the test through
//! [`ClusterTools`]: named [`AtomicCounter`]s and reusable double
//! [`Barrier`]s backed by the same database.
//!
//! ## Module Organization
//!
//! - [`cluster`] - Orchestrator, hosts, node arrays, and dispatch futures
//! - [`agent`] - The serving loop host and worker agents share
//! - [`rpc`] - Request/response protocol over paired message queues
//! - [`coordination`] - Backend connection, queues, counters, barriers
//! - [`tools`] - Counter/barrier surface handed to jobs and tests
//! - [`jobs`] - Job registry and the built-in job vocabulary
//! - [`launcher`] - How host agents come up (in-process thread or child process)
//! - [`process`] - Child process spawning, liveness, and scratch directories
//! - [`config`] - Cluster/array/node configuration builders
//! - [`identity`] - Global node ids and path derivation
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing setup for agents and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gridtest_core::{
//!     Cluster, ClusterConfiguration, NodeArrayConfiguration, NodeConfiguration, NodeJob,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let configuration = ClusterConfiguration::new()
//!     .with_database_url("postgresql://localhost/gridtest")
//!     .node_array(
//!         NodeArrayConfiguration::new("workers")
//!             .node(NodeConfiguration::new("0", "localhost"))
//!             .node(NodeConfiguration::new("1", "localhost")),
//!     );
//!
//! let cluster = Cluster::new(configuration).await?;
//! let workers = cluster.node_array("workers")?;
//!
//! let greetings = workers
//!     .execute_on_all(NodeJob::with_params(
//!         "echo",
//!         serde_json::json!({"greeting": "hello"}),
//!     ))
//!     .await;
//! greetings.get().await?;
//!
//! cluster.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Worker Executables
//!
//! Any binary can serve as a worker: call [`main_if_agent`] first thing in
//! `main`. When the cluster re-invokes the binary with agent arguments the
//! call serves the agent loop and exits; otherwise it returns immediately
//! and the program runs as itself. The bundled `gridtest-agent` binary is
//! the default executable when a configuration names none.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod launcher;
pub mod logging;
pub mod process;
pub mod rpc;
pub mod tools;

pub use agent::{
    main_if_agent, run_agent, run_agent_to_completion, AgentArgs, AgentConfig, AgentHandle,
};
pub use cluster::{Cluster, ClusterState, Host, Node, NodeArray, NodeArrayFuture};
pub use config::{
    AgentSettings, ClusterConfiguration, ExecutableSpec, LocalLauncherMode,
    NodeArrayConfiguration, NodeConfiguration,
};
pub use coordination::Coordination;
pub use error::{GridError, GridResult};
pub use identity::GlobalNodeId;
pub use jobs::{JobContext, JobRegistry, NodeJob};
pub use launcher::{HostLauncher, LocalProcessLauncher, LocalThreadLauncher};
pub use logging::init_logging;
pub use process::ProcessRef;
pub use tools::{AtomicCounter, Barrier, ClusterTools};

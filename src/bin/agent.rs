//! Gridtest Agent Binary
//!
//! Standalone agent entrypoint. The orchestrator re-invokes this binary (or
//! any user binary that calls `gridtest_core::main_if_agent`) with
//! `--node-path` and `--connect` to bring up a host agent or worker node.
//! It serves its command queue until shut down, aborted, or interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use gridtest_core::agent::{run_agent_to_completion, AgentArgs};
use gridtest_core::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = AgentArgs::parse().into_config()?;
    info!("Starting gridtest agent for {}", config.node_id);

    run_agent_to_completion(config).await?;
    Ok(())
}

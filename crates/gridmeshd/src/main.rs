//! gridmeshd — the gridmesh peer-to-peer content-distribution client.
//!
//! Registers with a directory, discovers peers, connects to one over the
//! datagram protocol, and downloads its exported Merkle tree by
//! hash-addressed fetches. A single long-lived process: the foreground
//! driver is a line-oriented stdin command loop (see `cli`), not a
//! daemon+API-client split like `summitd`/`summit-ctl`.

use std::sync::Arc;

use anyhow::Result;
use gridmesh_core::config::GridmeshConfig;
use gridmeshd::{cli, Orchestrator};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = GridmeshConfig::load()?;
    tracing::info!(name = %config.identity.name, "gridmesh starting");

    let orchestrator = Arc::new(Orchestrator::new(config)?);
    cli::run(orchestrator, filter_handle).await
}

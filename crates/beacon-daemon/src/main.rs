// SPDX-License-Identifier: MIT OR Apache-2.0
//! Beacon runner entry point.

use anyhow::Context as _;
use beacon_daemon::bootstrap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("BEACON_CONFIG").ok().map(PathBuf::from);
    let config = beacon_config::load_config(config_path.as_deref())
        .context("configuration load failed")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!(
        port = config.http_port,
        strategy = ?config.port_strategy,
        backend = ?config.provider_backend,
        "beacon runner starting"
    );

    let runner = bootstrap::build(config).await?;
    runner.serve().await
}

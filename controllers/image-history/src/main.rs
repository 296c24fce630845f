//! Image History Controller
//!
//! Watches pods across the cluster (or one namespace) and records, for every
//! container that ran, which image it used and when it started and stopped.
//!
//! Pod state is mirrored in a local cache that survives watch restarts, so
//! deletions observed only as tombstones still produce a record. Events are
//! stored append-only in PostgreSQL and served as JSON from `GET /images`.

mod api;
mod backoff;
mod cache;
mod config;
mod controller;
mod error;
mod metrics;
mod normalizer;
mod recorder;
mod source;
mod test_utils;
mod watcher;

use crate::config::Config;
use crate::controller::{shutdown_signal, Controller};
use crate::error::ControllerError;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and sqlx both pull in rustls; pick the provider explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Image History Controller");

    let config = Config::parse();
    config.validate()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace().unwrap_or("all namespaces"));
    info!("  Listen address: {}", config.listen_addr);
    info!("  Resync interval: {:?}", config.resync_interval());
    info!(
        "  Wait for sync: {} (timeout {:?})",
        config.wait_for_sync,
        config.sync_timeout()
    );
    info!(
        "  Record attempts: {}, concurrency: {}",
        config.record_max_attempts, config.record_concurrency
    );

    let controller = Controller::new(config).await?;
    controller.run(shutdown_signal()).await?;

    Ok(())
}

//! Command line and environment configuration.

use crate::error::ControllerError;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone)]
#[command(
    name = "image-history-controller",
    about = "Watches pods and records which container images ran where and when",
    version
)]
pub struct Config {
    #[arg(
        long,
        env = "KUBECONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "WATCH_NAMESPACE",
        help = "Namespace to watch (empty for all namespaces)"
    )]
    pub namespace: Option<String>,

    #[arg(long, env = "DATABASE_URL", help = "PostgreSQL connection URL")]
    pub database_url: String,

    #[arg(
        long,
        env = "LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "Address for the query API"
    )]
    pub listen_addr: SocketAddr,

    #[arg(
        long,
        env = "RESYNC_INTERVAL_SECS",
        default_value_t = 30,
        help = "Seconds between full re-lists of pods"
    )]
    pub resync_interval_secs: u64,

    #[arg(
        long,
        env = "WAIT_FOR_SYNC",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Wait for the pod cache to sync before serving queries"
    )]
    pub wait_for_sync: bool,

    #[arg(
        long,
        env = "SYNC_TIMEOUT_SECS",
        default_value_t = 60,
        help = "Seconds to wait for the initial cache sync"
    )]
    pub sync_timeout_secs: u64,

    #[arg(
        long,
        env = "RECORD_MAX_ATTEMPTS",
        default_value_t = 5,
        help = "Attempts per event before it is dropped"
    )]
    pub record_max_attempts: u32,

    #[arg(
        long,
        env = "RECORD_CONCURRENCY",
        default_value_t = 16,
        help = "Maximum concurrent store writes"
    )]
    pub record_concurrency: usize,

    #[arg(
        long,
        env = "DB_MAX_CONNECTIONS",
        default_value_t = 5,
        help = "Size of the database connection pool"
    )]
    pub db_max_connections: u32,
}

// The database URL may carry credentials.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("kubeconfig", &self.kubeconfig)
            .field("namespace", &self.namespace)
            .field("database_url", &"<redacted>")
            .field("listen_addr", &self.listen_addr)
            .field("resync_interval_secs", &self.resync_interval_secs)
            .field("wait_for_sync", &self.wait_for_sync)
            .field("sync_timeout_secs", &self.sync_timeout_secs)
            .field("record_max_attempts", &self.record_max_attempts)
            .field("record_concurrency", &self.record_concurrency)
            .field("db_max_connections", &self.db_max_connections)
            .finish()
    }
}

impl Config {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let non_zero = [
            ("resync-interval-secs", self.resync_interval_secs),
            ("sync-timeout-secs", self.sync_timeout_secs),
            ("record-max-attempts", u64::from(self.record_max_attempts)),
            ("record-concurrency", self.record_concurrency as u64),
            ("db-max-connections", u64::from(self.db_max_connections)),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ControllerError::InvalidConfig(format!("--{} must be greater than zero", name)));
        }

        if self.database_url.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("--database-url must not be empty".to_string()));
        }

        Ok(())
    }

    /// Namespace to watch; an empty string means all namespaces.
    pub fn watch_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

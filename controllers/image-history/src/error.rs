//! Controller-specific error types.
//!
//! This module defines error types specific to the image history controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use thiserror::Error;
use usage_store::StoreError;

/// Errors that can occur in the image history controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Usage store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An event could not be persisted after all retries
    #[error("Persistence failed after {attempts} attempts for {key}: {source}")]
    Persistence {
        key: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The cache did not sync before the deadline
    #[error("Timed out after {0:?} waiting for pod cache to sync")]
    SyncTimeout(std::time::Duration),

    /// Resource watch task failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Query API stopped unexpectedly
    #[error("Query API failed: {0}")]
    Api(String),

    /// Query server I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

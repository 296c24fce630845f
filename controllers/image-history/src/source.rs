//! Cluster event source.
//!
//! Abstracts the Kubernetes API server as a list + watch source of pod
//! snapshots. The watch loop only talks to [`ClusterEventSource`], which keeps
//! the cache and pipeline testable without a cluster.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use usage_store::parse_timestamp;

/// Server-side timeout for a single watch request, in seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Errors raised by a cluster event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transient failure (network reset, server busy); retry with backoff
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The source refused the request (expired version, auth); re-list from scratch
    #[error("Source rejected request: {0}")]
    Rejected(String),

    /// A single notification could not be decoded
    #[error("Malformed notification: {0}")]
    Malformed(String),
}

impl SourceError {
    fn from_status_code(code: u16, message: String) -> Self {
        match code {
            401 | 403 | 404 | 410 => SourceError::Rejected(format!("{code}: {message}")),
            _ => SourceError::Unavailable(format!("{code}: {message}")),
        }
    }
}

impl From<kube::Error> for SourceError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
            kube::Error::Api(resp) => SourceError::from_status_code(resp.code, resp.message.clone()),
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

/// Identity of a pod: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Image details of one container in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub image_id: String,
}

/// Local copy of a pod as observed from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedResource {
    pub name: String,
    pub namespace: String,
    pub phase: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub resource_version: Option<String>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl WatchedResource {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl TryFrom<&Pod> for WatchedResource {
    type Error = SourceError;

    fn try_from(pod: &Pod) -> Result<Self, Self::Error> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| SourceError::Malformed("pod without metadata.name".to_string()))?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let status = pod.status.as_ref();
        let start_time = status
            .and_then(|s| s.start_time.as_ref())
            .map(time_to_utc)
            .transpose()?;
        let container_statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| ContainerStatus {
                        name: cs.name.clone(),
                        image: cs.image.clone(),
                        image_id: cs.image_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            namespace,
            phase: status.and_then(|s| s.phase.clone()),
            start_time,
            resource_version: pod.metadata.resource_version.clone(),
            container_statuses,
        })
    }
}

/// Convert an apimachinery timestamp through its RFC3339 wire form.
fn time_to_utc(time: &Time) -> Result<DateTime<Utc>, SourceError> {
    let value = serde_json::to_value(time).map_err(|e| SourceError::Malformed(e.to_string()))?;
    let raw = value
        .as_str()
        .ok_or_else(|| SourceError::Malformed(format!("timestamp is not a string: {value}")))?;
    parse_timestamp(raw).map_err(|e| SourceError::Malformed(format!("timestamp {raw:?}: {e}")))
}

/// What a delete notification carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletedObject {
    /// The final state of the object
    Final(WatchedResource),
    /// Only the identity is known; `last_known` is a possibly stale copy
    Tombstone {
        key: ObjectKey,
        last_known: Option<WatchedResource>,
    },
}

impl DeletedObject {
    pub fn key(&self) -> ObjectKey {
        match self {
            DeletedObject::Final(resource) => resource.key(),
            DeletedObject::Tombstone { key, .. } => key.clone(),
        }
    }
}

/// A change notification from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Added(WatchedResource),
    Updated(WatchedResource),
    Deleted(DeletedObject),
}

/// Result of a full list.
#[derive(Debug, Default)]
pub struct InitialList {
    pub resources: Vec<WatchedResource>,
    /// Version to start the following watch from
    pub resource_version: String,
    /// Listed objects that could not be decoded
    pub malformed: usize,
}

pub type NotificationStream = BoxStream<'static, Result<Notification, SourceError>>;

/// Remote, authoritative store of pods.
///
/// Both calls are read-only. The watch stream may end or fail at any time,
/// after which the caller lists again and restarts the watch.
#[async_trait::async_trait]
pub trait ClusterEventSource: Send + Sync {
    /// List every pod and the version the list was taken at.
    async fn list_initial(&self) -> Result<InitialList, SourceError>;

    /// Watch for changes after `from_version`.
    async fn watch(&self, from_version: &str) -> Result<NotificationStream, SourceError>;
}

/// Event source backed by the Kubernetes pods API.
pub struct KubePodSource {
    api: Api<Pod>,
}

impl KubePodSource {
    /// Watch pods in `namespace`, or in all namespaces when `None`.
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { api }
    }
}

fn watch_event_to_notification(event: WatchEvent<Pod>) -> Option<Result<Notification, SourceError>> {
    match event {
        WatchEvent::Added(pod) => Some(WatchedResource::try_from(&pod).map(Notification::Added)),
        WatchEvent::Modified(pod) => {
            Some(WatchedResource::try_from(&pod).map(Notification::Updated))
        }
        WatchEvent::Deleted(pod) => Some(
            WatchedResource::try_from(&pod)
                .map(|resource| Notification::Deleted(DeletedObject::Final(resource))),
        ),
        WatchEvent::Bookmark(_) => None,
        WatchEvent::Error(err) => Some(Err(SourceError::from_status_code(
            err.code,
            err.message.clone(),
        ))),
    }
}

#[async_trait::async_trait]
impl ClusterEventSource for KubePodSource {
    async fn list_initial(&self) -> Result<InitialList, SourceError> {
        let list = self.api.list(&ListParams::default()).await?;
        let resource_version = list.metadata.resource_version.clone().ok_or_else(|| {
            SourceError::Unavailable("pod list response without resourceVersion".to_string())
        })?;

        let mut resources = Vec::with_capacity(list.items.len());
        let mut malformed = 0;
        for pod in &list.items {
            match WatchedResource::try_from(pod) {
                Ok(resource) => resources.push(resource),
                Err(e) => {
                    warn!("Skipping listed pod: {}", e);
                    malformed += 1;
                }
            }
        }

        debug!(
            "Listed {} pods at resourceVersion {}",
            resources.len(),
            resource_version
        );
        Ok(InitialList {
            resources,
            resource_version,
            malformed,
        })
    }

    async fn watch(&self, from_version: &str) -> Result<NotificationStream, SourceError> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&params, from_version).await?;

        Ok(stream
            .map_err(SourceError::from)
            .try_filter_map(|event| async move { watch_event_to_notification(event).transpose() })
            .boxed())
    }
}

/// Build a Kubernetes client.
///
/// Uses the kubeconfig at `kubeconfig` when given, otherwise the default
/// resolution (in-cluster service account, then `~/.kube/config`).
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, ControllerError> {
    match kubeconfig {
        Some(path) => {
            info!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                ControllerError::Kubeconfig(format!("failed to read {}: {}", path.display(), e))
            })?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        ControllerError::Kubeconfig(format!(
                            "invalid kubeconfig {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

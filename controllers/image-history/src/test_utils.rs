//! Test utilities for unit testing the watch pipeline
//!
//! This module provides helpers for creating test pods and a scripted
//! in-memory event source.

#![cfg(test)]

use crate::source::{
    ClusterEventSource, ContainerStatus, InitialList, Notification, NotificationStream,
    SourceError, WatchedResource,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use usage_store::parse_timestamp;

/// Helper to create a container status
pub fn container(name: &str, image: &str, image_id: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        image: image.to_string(),
        image_id: image_id.to_string(),
    }
}

/// Helper to create a watched pod; a start time marks it Running
pub fn resource(
    name: &str,
    namespace: &str,
    start_time: Option<&str>,
    containers: Vec<ContainerStatus>,
) -> WatchedResource {
    WatchedResource {
        name: name.to_string(),
        namespace: namespace.to_string(),
        phase: Some(if start_time.is_some() { "Running" } else { "Pending" }.to_string()),
        start_time: start_time.map(|ts| parse_timestamp(ts).unwrap()),
        resource_version: None,
        container_statuses: containers,
    }
}

/// The `web-1` pod used across scenario tests
pub fn web_1() -> WatchedResource {
    resource(
        "web-1",
        "default",
        Some("2024-01-01T00:00:00Z"),
        vec![container("app", "nginx:1.25", "sha256:abc")],
    )
}

/// Helper to create a Pod manifest as the API server would send it
pub fn pod_json(
    name: &str,
    namespace: &str,
    start_time: Option<&str>,
    containers: &[(&str, &str, &str)],
) -> Value {
    let statuses: Vec<Value> = containers
        .iter()
        .map(|(name, image, image_id)| {
            json!({
                "name": name,
                "image": image,
                "imageID": image_id,
                "ready": true,
                "restartCount": 0,
            })
        })
        .collect();

    let mut status = json!({
        "phase": if start_time.is_some() { "Running" } else { "Pending" },
        "containerStatuses": statuses,
    });
    if let Some(start_time) = start_time {
        status["startTime"] = json!(start_time);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": "1",
        },
        "status": status,
    })
}

/// Sender side of a scripted watch stream
pub type WatchFeed = mpsc::UnboundedSender<Result<Notification, SourceError>>;

/// Scripted event source.
///
/// Each `list_initial` / `watch` call pops the next scripted response. Once
/// a script is exhausted the call never completes, which parks the watch
/// loop until it is cancelled.
#[derive(Default)]
pub struct FakeSource {
    lists: Mutex<VecDeque<Result<InitialList, SourceError>>>,
    watches: Mutex<VecDeque<Result<NotificationStream, SourceError>>>,
    watch_versions: Mutex<Vec<String>>,
    list_calls: Mutex<usize>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful list
    pub fn push_list(&self, resources: Vec<WatchedResource>, version: &str) {
        self.lists.lock().unwrap().push_back(Ok(InitialList {
            resources,
            resource_version: version.to_string(),
            malformed: 0,
        }));
    }

    /// Script a failed list
    pub fn push_list_error(&self, error: SourceError) {
        self.lists.lock().unwrap().push_back(Err(error));
    }

    /// Script a watch that yields `items` and then ends
    pub fn push_watch(&self, items: Vec<Result<Notification, SourceError>>) {
        self.watches
            .lock()
            .unwrap()
            .push_back(Ok(futures::stream::iter(items).boxed()));
    }

    /// Script a watch fed live by the returned sender; dropping it ends the stream
    pub fn push_live_watch(&self) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        self.watches.lock().unwrap().push_back(Ok(stream.boxed()));
        tx
    }

    /// Script a watch that fails to open
    pub fn push_watch_error(&self, error: SourceError) {
        self.watches.lock().unwrap().push_back(Err(error));
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    /// Versions each watch was started from
    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ClusterEventSource for FakeSource {
    async fn list_initial(&self) -> Result<InitialList, SourceError> {
        *self.list_calls.lock().unwrap() += 1;
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, from_version: &str) -> Result<NotificationStream, SourceError> {
        self.watch_versions
            .lock()
            .unwrap()
            .push(from_version.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }
}

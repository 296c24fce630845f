//! Conversion of observed pod transitions into image usage events.

use crate::cache::Observation;
use crate::metrics::PipelineMetrics;
use crate::source::WatchedResource;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use usage_store::ImageUsageEvent;

/// Turns cache observations into canonical [`ImageUsageEvent`]s.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    metrics: PipelineMetrics,
}

impl EventNormalizer {
    pub fn new(metrics: PipelineMetrics) -> Self {
        Self { metrics }
    }

    /// Normalize one observation. `now` becomes `deletedAt` for deletions.
    pub fn normalize(&self, observation: Observation, now: DateTime<Utc>) -> Vec<ImageUsageEvent> {
        match observation {
            Observation::Added(resource) => events_for(&resource, None),
            Observation::Deleted {
                resource,
                from_tombstone,
            } => {
                if from_tombstone && resource.container_statuses.is_empty() {
                    warn!(
                        "Delete of {} recovered without container statuses",
                        resource.key()
                    );
                    self.metrics.lost_deletes.inc();
                    return Vec::new();
                }
                events_for(&resource, Some(now))
            }
            Observation::LostDelete(key) => {
                warn!("Lost delete of {}", key);
                self.metrics.lost_deletes.inc();
                Vec::new()
            }
        }
    }
}

fn events_for(resource: &WatchedResource, deleted_at: Option<DateTime<Utc>>) -> Vec<ImageUsageEvent> {
    let Some(started_at) = resource.start_time else {
        debug!("{} has no start time yet, skipping", resource.key());
        return Vec::new();
    };

    resource
        .container_statuses
        .iter()
        .map(|cs| ImageUsageEvent {
            pod: resource.name.clone(),
            container: cs.name.clone(),
            image: cs.image.clone(),
            image_id: cs.image_id.clone(),
            namespace: resource.namespace.clone(),
            started_at,
            deleted_at,
        })
        .collect()
}

//! Pipeline counters.
//!
//! Dropped and lost events are only visible through these counters and the
//! logs, so every non-fatal failure path increments one of them.

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{debug, info};

/// Counters for the watch -> normalize -> record pipeline.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    /// Deletes whose final state could not be recovered
    pub lost_deletes: IntCounter,
    /// Notifications that could not be decoded
    pub malformed_notifications: IntCounter,
    /// Events dropped after exhausting store retries
    pub persistence_failures: IntCounter,
    /// Events written as new rows
    pub events_recorded: IntCounter,
    /// Events the store already had
    pub duplicate_events: IntCounter,
    /// Times the list/watch cycle was restarted
    pub watch_restarts: IntCounter,
    /// Pods currently held in the cache
    pub cached_pods: IntGauge,
}

impl PipelineMetrics {
    /// Create counters registered in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("image_history".to_string()), None)?;

        let lost_deletes = IntCounter::new(
            "lost_deletes_total",
            "Pod deletions whose final state could not be recovered",
        )?;
        let malformed_notifications = IntCounter::new(
            "malformed_notifications_total",
            "Watch notifications dropped because they could not be decoded",
        )?;
        let persistence_failures = IntCounter::new(
            "persistence_failures_total",
            "Usage events dropped after exhausting store retries",
        )?;
        let events_recorded =
            IntCounter::new("events_recorded_total", "Usage events written to the store")?;
        let duplicate_events = IntCounter::new(
            "duplicate_events_total",
            "Usage events skipped because the store already had them",
        )?;
        let watch_restarts = IntCounter::new(
            "watch_restarts_total",
            "Times the pod list/watch cycle was restarted",
        )?;
        let cached_pods = IntGauge::new("cached_pods", "Pods currently held in the local cache")?;

        registry.register(Box::new(lost_deletes.clone()))?;
        registry.register(Box::new(malformed_notifications.clone()))?;
        registry.register(Box::new(persistence_failures.clone()))?;
        registry.register(Box::new(events_recorded.clone()))?;
        registry.register(Box::new(duplicate_events.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(cached_pods.clone()))?;

        Ok(Self {
            registry,
            lost_deletes,
            malformed_notifications,
            persistence_failures,
            events_recorded,
            duplicate_events,
            watch_restarts,
            cached_pods,
        })
    }

    /// Emit the current counter values as one structured log line.
    pub fn log_summary(&self) {
        info!(
            cached_pods = self.cached_pods.get(),
            events_recorded = self.events_recorded.get(),
            duplicate_events = self.duplicate_events.get(),
            lost_deletes = self.lost_deletes.get(),
            malformed_notifications = self.malformed_notifications.get(),
            persistence_failures = self.persistence_failures.get(),
            watch_restarts = self.watch_restarts.get(),
            "Pipeline counters"
        );
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => debug!("Pipeline metrics:\n{}", text),
            Err(e) => debug!("Failed to encode pipeline metrics: {}", e),
        }
    }
}

//! Durable recording of usage events with bounded retries.
//!
//! Duplicate suppression is delegated to the store's dedup key, so `record`
//! can be called concurrently and retried freely for the same event.

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::metrics::PipelineMetrics;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use usage_store::{ImageUsageEvent, InsertOutcome, UsageStoreTrait};

/// What happened to a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
}

/// Writes usage events to a store, retrying transient failures.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStoreTrait>,
    metrics: PipelineMetrics,
    max_attempts: u32,
    backoff: FibonacciBackoff,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl UsageRecorder {
    /// Create a recorder making at most `max_attempts` attempts per event.
    pub fn new(store: Arc<dyn UsageStoreTrait>, metrics: PipelineMetrics, max_attempts: u32) -> Self {
        Self {
            store,
            metrics,
            max_attempts: max_attempts.max(1),
            backoff: FibonacciBackoff::for_store_writes(),
        }
    }

    /// Persist one event.
    ///
    /// Retryable store errors are retried with Fibonacci backoff until the
    /// attempt budget is spent. A final failure is counted and returned; it
    /// never affects other events.
    pub async fn record(&self, event: &ImageUsageEvent) -> Result<RecordOutcome, ControllerError> {
        let mut backoff = self.backoff.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.insert(event).await {
                Ok(InsertOutcome::Inserted) => {
                    self.metrics.events_recorded.inc();
                    info!(
                        pod = %event.pod,
                        namespace = %event.namespace,
                        container = %event.container,
                        image = %event.image,
                        kind = %event.kind(),
                        "Recorded image usage"
                    );
                    return Ok(RecordOutcome::Inserted);
                }
                Ok(InsertOutcome::Duplicate) => {
                    self.metrics.duplicate_events.inc();
                    debug!("Event {} already recorded", event.dedup_key());
                    return Ok(RecordOutcome::Duplicate);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        "Failed to record {} (attempt {}/{}): {}. Retrying in {:?}",
                        event.dedup_key(),
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.persistence_failures.inc();
                    error!(
                        "Dropping event {} after {} attempts: {}",
                        event.dedup_key(),
                        attempt,
                        e
                    );
                    return Err(ControllerError::Persistence {
                        key: event.dedup_key().to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

//! Pod watch loop.
//!
//! The [`Reflector`] lists all pods, starts a watch from the list's resource
//! version, and applies every notification to the cache. Observed
//! transitions are handed to the [`EventDispatcher`], which normalizes and
//! records them in background tasks so a slow or failing store never stalls
//! the watch.
//!
//! The loop re-lists every resync interval, and after a backoff delay when
//! the stream ends or the source fails. The delay grows until a watch
//! delivers something or stays open for [`MIN_HEALTHY_WATCH`]. The loop only
//! returns once cancelled.

use crate::backoff::FibonacciBackoff;
use crate::cache::{CacheWriter, Observation};
use crate::metrics::PipelineMetrics;
use crate::normalizer::EventNormalizer;
use crate::recorder::UsageRecorder;
use crate::source::{ClusterEventSource, SourceError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use usage_store::now_truncated;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A watch open at least this long counts as healthy even if it was quiet.
const MIN_HEALTHY_WATCH: Duration = Duration::from_secs(10);

/// Normalizes observations and records the resulting events concurrently.
#[derive(Clone)]
pub struct EventDispatcher {
    normalizer: EventNormalizer,
    recorder: UsageRecorder,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    clock: Clock,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("in_flight", &self.tracker.len())
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// `concurrency` bounds the number of store writes in flight.
    pub fn new(normalizer: EventNormalizer, recorder: UsageRecorder, concurrency: usize) -> Self {
        Self {
            normalizer,
            recorder,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            clock: Arc::new(now_truncated),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Normalize `observation` and spawn one record task per event.
    pub fn dispatch(&self, observation: Observation) {
        let now = (self.clock)();
        for event in self.normalizer.normalize(observation, now) {
            let recorder = self.recorder.clone();
            let permits = Arc::clone(&self.permits);
            self.tracker.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = recorder.record(&event).await {
                    debug!("Record task finished with error: {}", e);
                }
            });
        }
    }

    /// Wait for every spawned record task to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Why a list/watch session ended without a source error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Resync,
    StreamEnded,
}

/// Keeps the cache in step with the cluster.
pub struct Reflector {
    source: Arc<dyn ClusterEventSource>,
    writer: CacheWriter,
    dispatcher: EventDispatcher,
    metrics: PipelineMetrics,
    resync_interval: Duration,
    backoff: FibonacciBackoff,
}

impl Reflector {
    pub fn new(
        source: Arc<dyn ClusterEventSource>,
        writer: CacheWriter,
        dispatcher: EventDispatcher,
        metrics: PipelineMetrics,
        resync_interval: Duration,
    ) -> Self {
        Self {
            source,
            writer,
            dispatcher,
            metrics,
            resync_interval,
            backoff: FibonacciBackoff::for_watch(),
        }
    }

    /// Run until `cancel` fires. Once cancelled the cache is never touched again.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Starting pod watcher");

        while !cancel.is_cancelled() {
            let delay = match self.list_and_watch(&cancel).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Resync) => {
                    debug!("Resync interval elapsed, re-listing pods");
                    None
                }
                Ok(SessionEnd::StreamEnded) => {
                    let delay = self.backoff.next_backoff();
                    info!("Pod watch stream ended, re-listing in {:?}", delay);
                    Some(delay)
                }
                Err(e) => {
                    let delay = self.backoff.next_backoff();
                    match e {
                        SourceError::Rejected(_) => {
                            error!("Pod watch rejected: {}. Re-listing from scratch in {:?}", e, delay);
                        }
                        _ => warn!("Pod watch failed: {}. Retrying in {:?}", e, delay),
                    }
                    Some(delay)
                }
            };
            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            self.metrics.watch_restarts.inc();
            self.metrics.log_summary();
        }

        info!("Pod watcher stopped");
    }

    async fn list_and_watch(&mut self, cancel: &CancellationToken) -> Result<SessionEnd, SourceError> {
        let list = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            list = self.source.list_initial() => list?,
        };

        if list.malformed > 0 {
            self.metrics.malformed_notifications.inc_by(list.malformed as u64);
        }
        debug!(
            "Applying list of {} pods at resourceVersion {}",
            list.resources.len(),
            list.resource_version
        );
        for observation in self.writer.replace(list.resources) {
            self.dispatcher.dispatch(observation);
        }
        self.update_cache_gauge();

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            stream = self.source.watch(&list.resource_version) => stream?,
        };
        self.writer.mark_watch_established();
        let opened = Instant::now();

        let resync = tokio::time::sleep(self.resync_interval);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                () = &mut resync => {
                    self.backoff.reset();
                    return Ok(SessionEnd::Resync);
                }
                item = stream.next() => match item {
                    None => {
                        if opened.elapsed() >= MIN_HEALTHY_WATCH {
                            self.backoff.reset();
                        }
                        return Ok(SessionEnd::StreamEnded);
                    }
                    Some(Ok(notification)) => {
                        self.backoff.reset();
                        if let Some(observation) = self.writer.apply(notification) {
                            self.dispatcher.dispatch(observation);
                        }
                        self.update_cache_gauge();
                    }
                    Some(Err(SourceError::Malformed(reason))) => {
                        self.backoff.reset();
                        warn!("Dropping malformed notification: {}", reason);
                        self.metrics.malformed_notifications.inc();
                    }
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    fn update_cache_gauge(&self) {
        self.metrics
            .cached_pods
            .set(i64::try_from(self.writer.len()).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheReader, ResourceCache};
    use crate::source::{DeletedObject, Notification, ObjectKey};
    use crate::test_utils::{container, resource, web_1, FakeSource};
    use tokio::task::JoinHandle;
    use usage_store::{parse_timestamp, MockUsageStore};

    struct Harness {
        source: Arc<FakeSource>,
        store: MockUsageStore,
        metrics: PipelineMetrics,
        reader: CacheReader,
        dispatcher: EventDispatcher,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(source: FakeSource) -> Self {
            let source = Arc::new(source);
            let store = MockUsageStore::new();
            let metrics = PipelineMetrics::new().unwrap();
            let recorder = UsageRecorder::new(Arc::new(store.clone()), metrics.clone(), 3);
            let dispatcher = EventDispatcher::new(EventNormalizer::new(metrics.clone()), recorder, 4)
                .with_clock(|| parse_timestamp("2024-01-01T01:00:00Z").unwrap());
            let (writer, reader) = ResourceCache::new();
            let reflector = Reflector::new(
                source.clone(),
                writer,
                dispatcher.clone(),
                metrics.clone(),
                Duration::from_secs(30),
            );
            let cancel = CancellationToken::new();
            let task = tokio::spawn(reflector.run(cancel.clone()));

            Self {
                source,
                store,
                metrics,
                reader,
                dispatcher,
                cancel,
                task,
            }
        }

        async fn stop(&mut self) {
            self.cancel.cancel();
            (&mut self.task).await.unwrap();
            self.dispatcher.drain().await;
        }
    }

    /// Let spawned tasks make progress without advancing the paused clock much.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_add_then_delete_scenario() {
        let source = FakeSource::new();
        source.push_list(vec![], "100");
        source.push_watch(vec![
            Ok(Notification::Added(web_1())),
            Ok(Notification::Deleted(DeletedObject::Final(web_1()))),
        ]);

        let mut harness = Harness::start(source);
        assert!(harness.reader.wait_until_synced(Duration::from_secs(5)).await);
        settle().await;
        harness.stop().await;

        let mut json: Vec<String> = harness
            .store
            .rows()
            .iter()
            .map(|row| serde_json::to_string(row).unwrap())
            .collect();
        json.sort();
        assert_eq!(
            json,
            vec![
                r#"{"pod":"web-1","container":"app","image":"nginx:1.25","imageID":"sha256:abc","namespace":"default","startedAt":"2024-01-01T00:00:00Z","deletedAt":""}"#,
                r#"{"pod":"web-1","container":"app","image":"nginx:1.25","imageID":"sha256:abc","namespace":"default","startedAt":"2024-01-01T00:00:00Z","deletedAt":"2024-01-01T01:00:00Z"}"#,
            ]
        );
        assert_eq!(harness.source.watch_versions()[0], "100");
    }

    #[tokio::test]
    async fn test_tombstone_without_state_writes_nothing() {
        let source = FakeSource::new();
        source.push_list(vec![], "1");
        source.push_watch(vec![Ok(Notification::Deleted(DeletedObject::Tombstone {
            key: ObjectKey::new("default", "web-1"),
            last_known: None,
        }))]);

        let mut harness = Harness::start(source);
        settle().await;
        harness.stop().await;

        assert!(harness.store.rows().is_empty());
        assert_eq!(harness.metrics.lost_deletes.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_add_after_restart_is_not_duplicated() {
        let source = FakeSource::new();
        // First session: listed pod, stream ends
        source.push_list(vec![web_1()], "1");
        source.push_watch(vec![Ok(Notification::Added(web_1()))]);
        // Second session re-lists the same pod
        source.push_list(vec![web_1()], "2");
        let feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        tokio::time::sleep(Duration::from_secs(2)).await;
        feed.send(Ok(Notification::Updated(web_1()))).unwrap();
        settle().await;
        harness.stop().await;

        assert_eq!(harness.store.rows().len(), 1);
        assert_eq!(harness.store.rows()[0].deleted_at, None);
        assert_eq!(harness.source.watch_versions(), vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relist_records_missed_delete() {
        let source = FakeSource::new();
        source.push_list(vec![web_1()], "1");
        source.push_watch(vec![]);
        // web-1 was deleted while the stream was down
        source.push_list(vec![], "2");

        let mut harness = Harness::start(source);
        tokio::time::sleep(Duration::from_secs(2)).await;
        harness.stop().await;

        let rows = harness.store.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.deleted_at.is_some()));
        assert!(harness.reader.is_empty());
        assert_eq!(harness.metrics.lost_deletes.get(), 0);
    }

    #[tokio::test]
    async fn test_malformed_notification_is_counted_and_skipped() {
        let source = FakeSource::new();
        source.push_list(vec![], "1");
        let feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        settle().await;
        feed.send(Err(SourceError::Malformed("bad pod".to_string()))).unwrap();
        feed.send(Ok(Notification::Added(web_1()))).unwrap();
        settle().await;
        harness.stop().await;

        assert_eq!(harness.metrics.malformed_notifications.get(), 1);
        assert_eq!(harness.store.rows().len(), 1);
        // The stream was not restarted
        assert_eq!(harness.source.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_source_is_retried() {
        let source = FakeSource::new();
        source.push_list_error(SourceError::Unavailable("connection refused".to_string()));
        source.push_list(vec![web_1()], "5");
        source.push_watch_error(SourceError::Rejected("410: too old resource version".to_string()));
        source.push_list(vec![web_1()], "6");
        let _feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        assert!(harness.reader.wait_until_synced(Duration::from_secs(60)).await);
        harness.stop().await;

        assert_eq!(harness.source.list_calls(), 3);
        assert_eq!(harness.source.watch_versions(), vec!["5", "6"]);
        assert_eq!(harness.store.rows().len(), 1);
        assert!(harness.metrics.watch_restarts.get() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_interval_triggers_relist() {
        let source = FakeSource::new();
        source.push_list(vec![web_1()], "1");
        let _first = source.push_live_watch();
        source.push_list(vec![], "2");
        let _second = source.push_live_watch();

        let mut harness = Harness::start(source);
        assert!(harness.reader.wait_until_synced(Duration::from_secs(1)).await);
        assert_eq!(harness.reader.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        harness.stop().await;

        assert_eq!(harness.source.list_calls(), 2);
        assert!(harness.reader.is_empty());
    }

    #[tokio::test]
    async fn test_no_mutation_after_cancel() {
        let source = FakeSource::new();
        source.push_list(vec![], "1");
        let feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        settle().await;
        harness.stop().await;

        // The stream was dropped with the watch task
        assert!(feed
            .send(Ok(Notification::Added(resource(
                "late",
                "default",
                Some("2024-01-01T00:00:00Z"),
                vec![container("app", "nginx:1.25", "sha256:abc")],
            ))))
            .is_err());
        assert!(harness.reader.is_empty());
        assert!(harness.store.rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_sessions_back_off() {
        let source = FakeSource::new();
        for version in 0..10 {
            source.push_list(vec![], &version.to_string());
            source.push_watch(vec![]);
        }

        let mut harness = Harness::start(source);
        // Lists at 0s, 1s, 2s, 4s and 7s; the next one is due at 12s
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(harness.source.list_calls(), 5);
        harness.stop().await;

        // The fifth restart is still waiting out its delay
        assert_eq!(harness.metrics.watch_restarts.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivering_watch_resets_backoff() {
        let source = FakeSource::new();
        for version in 0..4 {
            source.push_list(vec![web_1()], &version.to_string());
            source.push_watch(vec![Ok(Notification::Added(web_1()))]);
        }

        let mut harness = Harness::start(source);
        // Every session delivered an event, so each restart waits the base delay
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(harness.source.list_calls(), 4);
        harness.stop().await;

        assert_eq!(harness.store.rows().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_quiet_watch_resets_backoff() {
        let source = FakeSource::new();
        source.push_list(vec![], "1");
        source.push_watch(vec![]);
        source.push_list(vec![], "2");
        source.push_watch(vec![]);
        source.push_list(vec![], "3");
        let feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        // Third session opens at 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(harness.source.list_calls(), 3);

        tokio::time::sleep(MIN_HEALTHY_WATCH + Duration::from_secs(5)).await;
        drop(feed);
        // Without the reset the next delay would be 2s
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(harness.source.list_calls(), 4);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_mid_stream_relists_after_backoff() {
        let source = FakeSource::new();
        source.push_list(vec![], "1");
        source.push_watch(vec![
            Ok(Notification::Added(web_1())),
            Err(SourceError::Unavailable("connection reset".to_string())),
        ]);
        source.push_list(vec![web_1()], "2");
        let _feed = source.push_live_watch();

        let mut harness = Harness::start(source);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(harness.source.list_calls(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(harness.source.list_calls(), 2);
        assert_eq!(harness.source.watch_versions(), vec!["1", "2"]);
        assert_eq!(harness.reader.len(), 1);
        harness.stop().await;

        assert!(harness.metrics.watch_restarts.get() >= 1);
        assert_eq!(harness.store.rows().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_promptly() {
        let source = FakeSource::new();
        source.push_list_error(SourceError::Unavailable("connection refused".to_string()));
        source.push_list(vec![web_1()], "1");

        let mut harness = Harness::start(source);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let cancelled_at = Instant::now();
        harness.stop().await;

        assert!(cancelled_at.elapsed() < Duration::from_millis(100));
        assert_eq!(harness.source.list_calls(), 1);
        assert!(harness.reader.is_empty());
    }
}

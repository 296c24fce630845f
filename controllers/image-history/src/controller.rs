//! Main controller implementation.
//!
//! The `Controller` wires the pod source, cache, normalizer, recorder and
//! query API together, and owns their lifecycle from startup to a graceful
//! shutdown.

use crate::api::{create_router, serve};
use crate::cache::{CacheReader, ResourceCache};
use crate::config::Config;
use crate::error::ControllerError;
use crate::metrics::PipelineMetrics;
use crate::normalizer::EventNormalizer;
use crate::recorder::UsageRecorder;
use crate::source::{kube_client, ClusterEventSource, KubePodSource};
use crate::watcher::{EventDispatcher, Reflector};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use usage_store::{PgUsageStore, UsageStoreTrait};

/// Which task ended the main wait.
enum Exit {
    Signal,
    Watcher(Result<(), JoinError>),
    Api(Result<Result<(), ControllerError>, JoinError>),
}

/// Main controller for image usage recording.
pub struct Controller {
    config: Config,
    source: Arc<dyn ClusterEventSource>,
    store: Arc<dyn UsageStoreTrait>,
    metrics: PipelineMetrics,
}

impl Controller {
    /// Creates a controller connected to the cluster and the database.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing image history controller");

        let client = kube_client(config.kubeconfig.as_deref()).await?;
        let source = KubePodSource::new(client, config.watch_namespace());

        info!("Connecting to usage store...");
        let store = PgUsageStore::connect(&config.database_url, config.db_max_connections)
            .await
            .map_err(|e| {
                error!("Failed to connect to the usage store: {}", e);
                ControllerError::Store(e)
            })?;
        info!("Usage store connection established");

        Self::from_parts(config, Arc::new(source), Arc::new(store))
    }

    /// Creates a controller over an existing source and store.
    pub fn from_parts(
        config: Config,
        source: Arc<dyn ClusterEventSource>,
        store: Arc<dyn UsageStoreTrait>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            store,
            metrics: PipelineMetrics::new()?,
        })
    }

    /// Run until `shutdown` resolves or a background task stops.
    ///
    /// In-flight records are allowed to finish before this returns.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ControllerError> {
        let Self {
            config,
            source,
            store,
            metrics,
        } = self;
        let cancel = CancellationToken::new();

        let recorder = UsageRecorder::new(store.clone(), metrics.clone(), config.record_max_attempts);
        let dispatcher = EventDispatcher::new(
            EventNormalizer::new(metrics.clone()),
            recorder,
            config.record_concurrency,
        );
        let (writer, reader) = ResourceCache::new();
        let cache = reader.clone();
        let reflector = Reflector::new(
            source,
            writer,
            dispatcher.clone(),
            metrics.clone(),
            config.resync_interval(),
        );
        let mut watch_task = tokio::spawn(reflector.run(cancel.clone()));

        let mut api_task = {
            let cancel = cancel.clone();
            let wait_for_sync = config.wait_for_sync;
            let timeout = config.sync_timeout();
            let addr = config.listen_addr;
            tokio::spawn(async move {
                if wait_for_sync {
                    if !await_cache_sync(&reader, timeout, &cancel).await {
                        return Ok(());
                    }
                    log_cache_summary(&reader);
                } else if !reader.has_synced() {
                    warn!("Serving queries before the pod cache has synced");
                }
                let listener = TcpListener::bind(addr).await?;
                serve(listener, create_router(store), cancel).await
            })
        };

        info!("Image history controller running");
        tokio::pin!(shutdown);
        let exit = tokio::select! {
            () = &mut shutdown => Exit::Signal,
            joined = &mut watch_task => Exit::Watcher(joined),
            joined = &mut api_task => Exit::Api(joined),
        };

        info!("Shutting down");
        cancel.cancel();

        let result = match exit {
            Exit::Signal => {
                join_watcher(watch_task.await);
                join_api(api_task.await)
            }
            Exit::Watcher(joined) => {
                if let Err(e) = join_api(api_task.await) {
                    warn!("Query API failed during shutdown: {}", e);
                }
                match joined {
                    Ok(()) => Err(ControllerError::Watch("pod watcher exited unexpectedly".to_string())),
                    Err(e) => Err(ControllerError::Watch(format!("pod watcher panicked: {}", e))),
                }
            }
            Exit::Api(joined) => {
                join_watcher(watch_task.await);
                match joined {
                    Ok(Ok(())) => Err(ControllerError::Api("query API exited unexpectedly".to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(ControllerError::Api(format!("query API panicked: {}", e))),
                }
            }
        };

        info!("Waiting for in-flight records to finish");
        dispatcher.drain().await;
        log_cache_summary(&cache);
        metrics.log_summary();
        info!("Image history controller stopped");

        result
    }
}

/// Gate the query API on the cache sync.
///
/// A sync that misses `timeout` is logged, but the API still starts once the
/// cache catches up. Returns `false` only if `cancel` fires first.
async fn await_cache_sync(reader: &CacheReader, timeout: Duration, cancel: &CancellationToken) -> bool {
    info!("Waiting up to {:?} for pod cache to sync", timeout);
    if reader.wait_until_synced(timeout).await {
        return true;
    }

    error!(
        "{}. Query API will start once the cache syncs; pod watching continues",
        ControllerError::SyncTimeout(timeout)
    );
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        synced = reader.synced() => {
            if synced {
                info!("Pod cache synced after the startup timeout");
            }
            synced
        }
    }
}

fn log_cache_summary(reader: &CacheReader) {
    if reader.is_empty() {
        warn!("Pod cache is empty ({:?}); check the watched namespace", reader.sync_state());
        return;
    }
    let pods = reader.snapshot();
    let namespaces: BTreeSet<&str> = pods.iter().map(|pod| pod.namespace.as_str()).collect();
    info!(
        "Pod cache {:?}: {} pods across {} namespaces",
        reader.sync_state(),
        pods.len(),
        namespaces.len()
    );
}

fn join_watcher(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!("Pod watcher panicked during shutdown: {}", e);
    }
}

fn join_api(joined: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ControllerError::Api(format!("query API panicked: {}", e))),
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Notification;
    use crate::cache::ResourceCache;
    use crate::test_utils::{web_1, FakeSource};
    use clap::Parser;
    use tokio::sync::oneshot;
    use usage_store::MockUsageStore;

    fn config(extra: &[&str]) -> Config {
        let mut args = vec![
            "image-history-controller",
            "--database-url",
            "postgres://unused",
            "--listen-addr",
            "127.0.0.1:0",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Controller::from_parts(
            config(&["--record-concurrency", "0"]),
            Arc::new(FakeSource::new()),
            Arc::new(MockUsageStore::new()),
        );
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_records_and_shuts_down_gracefully() {
        let source = Arc::new(FakeSource::new());
        source.push_list(vec![], "1");
        let feed = source.push_live_watch();
        let store = MockUsageStore::new();

        let controller =
            Controller::from_parts(config(&[]), source.clone(), Arc::new(store.clone())).unwrap();
        let metrics = controller.metrics.clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(controller.run(async {
            let _ = stopped.await;
        }));

        feed.send(Ok(Notification::Added(web_1()))).unwrap();
        for _ in 0..200 {
            if !store.rows().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(store.rows().len(), 1);
        assert_eq!(metrics.events_recorded.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_keeps_watching() {
        // The list never completes, so the cache never syncs
        let source = Arc::new(FakeSource::new());
        let store = MockUsageStore::new();

        let controller = Controller::from_parts(
            config(&["--sync-timeout-secs", "1"]),
            source.clone(),
            Arc::new(store),
        )
        .unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(controller.run(async {
            let _ = stopped.await;
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!running.is_finished());
        assert_eq!(source.list_calls(), 1);

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_sync_opens_the_gate() {
        let (mut writer, reader) = ResourceCache::new();
        let cancel = CancellationToken::new();

        let gate = tokio::spawn({
            let cancel = cancel.clone();
            async move { await_cache_sync(&reader, Duration::from_secs(1), &cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!gate.is_finished());

        writer.replace(vec![web_1()]);
        writer.mark_watch_established();
        assert!(gate.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_sync_keeps_the_gate_closed() {
        let (_writer, reader) = ResourceCache::new();
        let cancel = CancellationToken::new();

        let gate = tokio::spawn({
            let cancel = cancel.clone();
            async move { await_cache_sync(&reader, Duration::from_secs(1), &cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert!(!gate.await.unwrap());
    }
}

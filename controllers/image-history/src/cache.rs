//! Local reflected cache of watched pods.
//!
//! The cache is split into a single [`CacheWriter`], owned by the watch task,
//! and any number of [`CacheReader`]s. Applying a notification returns the
//! add/delete transitions ([`Observation`]s) that the pipeline turns into
//! usage events.
//!
//! Sync progresses `Unsynced -> Syncing -> Synced`: a full list moves the
//! cache to `Syncing`, and the first watch established after it moves it to
//! `Synced`, where it stays across later relists.

use crate::source::{ContainerStatus, DeletedObject, Notification, ObjectKey, WatchedResource};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Sync progress of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
}

/// A lifecycle transition observed while applying notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Pod is running; `container_statuses` only holds containers with a
    /// resolved image ID that were not signaled before
    Added(WatchedResource),
    /// Pod is gone; `resource` is its final or best-effort last known state
    Deleted {
        resource: WatchedResource,
        from_tombstone: bool,
    },
    /// Pod is gone and nothing is known about its final state
    LostDelete(ObjectKey),
}

#[derive(Debug)]
struct CacheEntry {
    resource: WatchedResource,
    revision: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ObjectKey, CacheEntry>,
    /// Containers already signaled as added, per pod: (container, start time)
    signaled: HashMap<ObjectKey, HashSet<(String, DateTime<Utc>)>>,
    next_revision: u64,
}

impl CacheState {
    fn upsert(&mut self, resource: WatchedResource) -> Option<Observation> {
        let key = resource.key();

        let fresh: Vec<ContainerStatus> = match resource.start_time {
            Some(started) => {
                let signaled = self.signaled.entry(key.clone()).or_default();
                resource
                    .container_statuses
                    .iter()
                    // A container without an image ID is signaled once it reports one
                    .filter(|cs| {
                        !cs.image_id.is_empty() && signaled.insert((cs.name.clone(), started))
                    })
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };

        self.next_revision += 1;
        debug!(
            "Cached {} at revision {} (phase {:?}, resourceVersion {:?})",
            key,
            self.next_revision,
            resource.phase,
            resource.resource_version
        );
        let observation = (!fresh.is_empty()).then(|| {
            Observation::Added(WatchedResource {
                container_statuses: fresh,
                ..resource.clone()
            })
        });
        self.entries.insert(
            key,
            CacheEntry {
                resource,
                revision: self.next_revision,
            },
        );

        observation
    }

    fn delete(&mut self, deleted: DeletedObject) -> Observation {
        let key = deleted.key();
        let cached = self.entries.remove(&key).map(|entry| {
            debug!("Evicted {} at revision {}", key, entry.revision);
            entry.resource
        });
        self.signaled.remove(&key);

        match deleted {
            DeletedObject::Final(resource) => Observation::Deleted {
                resource,
                from_tombstone: false,
            },
            DeletedObject::Tombstone { key, last_known } => match cached.or(last_known) {
                Some(resource) => {
                    debug!("Recovered final state of {} from cache", key);
                    Observation::Deleted {
                        resource,
                        from_tombstone: true,
                    }
                }
                None => {
                    warn!("Dropping delete of {}: no final state available", key);
                    Observation::LostDelete(key)
                }
            },
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: RwLock<CacheState>,
    sync: watch::Sender<SyncState>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Constructor for the writer/reader pair.
#[derive(Debug)]
pub struct ResourceCache;

impl ResourceCache {
    /// Create an empty, unsynced cache.
    #[allow(clippy::new_ret_no_self, reason = "returns the writer/reader pair")]
    pub fn new() -> (CacheWriter, CacheReader) {
        let (sync, _) = watch::channel(SyncState::Unsynced);
        let shared = Arc::new(Shared {
            state: RwLock::new(CacheState::default()),
            sync,
        });
        (
            CacheWriter {
                shared: Arc::clone(&shared),
            },
            CacheReader { shared },
        )
    }
}

/// The only handle that can mutate the cache.
#[derive(Debug)]
pub struct CacheWriter {
    shared: Arc<Shared>,
}

impl CacheWriter {
    /// Apply one notification in arrival order.
    pub fn apply(&mut self, notification: Notification) -> Option<Observation> {
        let mut state = self.shared.write();
        match notification {
            Notification::Added(resource) | Notification::Updated(resource) => {
                state.upsert(resource)
            }
            Notification::Deleted(deleted) => Some(state.delete(deleted)),
        }
    }

    /// Reconcile the cache with a full list.
    ///
    /// Every listed pod is applied as an add; cached pods missing from the
    /// list were deleted while we were not watching and are removed through
    /// the tombstone path.
    pub fn replace(&mut self, resources: Vec<WatchedResource>) -> Vec<Observation> {
        let mut observations = Vec::new();
        {
            let mut state = self.shared.write();

            let listed: HashSet<ObjectKey> = resources.iter().map(WatchedResource::key).collect();
            let mut vanished: Vec<ObjectKey> = state
                .entries
                .keys()
                .filter(|key| !listed.contains(*key))
                .cloned()
                .collect();
            vanished.sort();

            for resource in resources {
                observations.extend(state.upsert(resource));
            }
            for key in vanished {
                debug!("{} vanished between lists", key);
                observations.push(state.delete(DeletedObject::Tombstone {
                    key,
                    last_known: None,
                }));
            }
        }

        self.shared.sync.send_if_modified(|sync| {
            if *sync == SyncState::Unsynced {
                *sync = SyncState::Syncing;
                true
            } else {
                false
            }
        });

        observations
    }

    /// Record that a watch is running on top of a completed list.
    pub fn mark_watch_established(&mut self) {
        self.shared.sync.send_if_modified(|sync| {
            if *sync == SyncState::Syncing {
                *sync = SyncState::Synced;
                true
            } else {
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.shared.read().entries.len()
    }
}

/// Read-only view of the cache.
#[derive(Debug, Clone)]
pub struct CacheReader {
    shared: Arc<Shared>,
}

impl CacheReader {
    #[cfg(test)]
    pub fn get(&self, key: &ObjectKey) -> Option<WatchedResource> {
        self.shared
            .read()
            .entries
            .get(key)
            .map(|entry| entry.resource.clone())
    }

    /// Revision assigned when `key` was last upserted.
    #[cfg(test)]
    pub fn revision(&self, key: &ObjectKey) -> Option<u64> {
        self.shared.read().entries.get(key).map(|entry| entry.revision)
    }

    /// All cached pods, ordered by key.
    pub fn snapshot(&self) -> Vec<WatchedResource> {
        let mut resources: Vec<WatchedResource> = self
            .shared
            .read()
            .entries
            .values()
            .map(|entry| entry.resource.clone())
            .collect();
        resources.sort_by_key(WatchedResource::key);
        resources
    }

    pub fn len(&self) -> usize {
        self.shared.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sync_state(&self) -> SyncState {
        *self.shared.sync.borrow()
    }

    pub fn has_synced(&self) -> bool {
        self.sync_state() == SyncState::Synced
    }

    /// Wait, without a deadline, until the cache is synced.
    pub async fn synced(&self) -> bool {
        let mut rx = self.shared.sync.subscribe();
        rx.wait_for(|state| *state == SyncState::Synced).await.is_ok()
    }

    /// Wait until the cache is synced. Returns `false` if `timeout` elapses first.
    pub async fn wait_until_synced(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.synced())
            .await
            .unwrap_or(false)
    }
}

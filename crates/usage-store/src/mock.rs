//! Mock UsageStore for unit testing
//!
//! This module provides an in-memory implementation of `UsageStoreTrait` that
//! can be used in unit tests without requiring a running database.

use crate::error::StoreError;
use crate::models::{DedupKey, ImageUsageEvent};
use crate::usage_trait::{InsertOutcome, UsageStoreTrait};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    rows: Vec<ImageUsageEvent>,
    keys: HashSet<DedupKey>,
    fail_next_inserts: usize,
    fail_list: bool,
    insert_attempts: usize,
}

/// Mock UsageStore for testing
///
/// Rows are kept in insertion order and the dedup key is enforced the same
/// way the database unique index does. Failures can be injected to exercise
/// retry paths.
#[derive(Debug, Clone, Default)]
pub struct MockUsageStore {
    state: Arc<Mutex<MockState>>,
}

impl MockUsageStore {
    /// Create an empty mock store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` inserts fail with a retryable error
    pub fn fail_next_inserts(&self, count: usize) {
        self.state().fail_next_inserts = count;
    }

    /// Make `list` fail until reset
    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    /// Snapshot of stored rows (for assertions)
    #[must_use]
    pub fn rows(&self) -> Vec<ImageUsageEvent> {
        self.state().rows.clone()
    }

    /// Number of insert calls seen, including failed and duplicate ones
    #[must_use]
    pub fn insert_attempts(&self) -> usize {
        self.state().insert_attempts
    }
}

#[async_trait::async_trait]
impl UsageStoreTrait for MockUsageStore {
    async fn insert(&self, event: &ImageUsageEvent) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state();
        state.insert_attempts += 1;

        if state.fail_next_inserts > 0 {
            state.fail_next_inserts -= 1;
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }

        if !state.keys.insert(event.dedup_key()) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.rows.push(event.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list(&self) -> Result<Vec<ImageUsageEvent>, StoreError> {
        let state = self.state();
        if state.fail_list {
            return Err(StoreError::Unavailable("injected list failure".to_string()));
        }
        Ok(state.rows.clone())
    }
}

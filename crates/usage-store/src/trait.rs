//! UsageStore trait for mocking
//!
//! This trait abstracts the persistence backend so the controller can be unit
//! tested without a running database. `PgUsageStore` implements it for
//! PostgreSQL, and `MockUsageStore` keeps rows in memory.

use crate::error::StoreError;
use crate::models::ImageUsageEvent;

/// Result of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written
    Inserted,
    /// A row with the same dedup key already existed; nothing was written
    Duplicate,
}

/// Append-only sink and reader for image usage events.
///
/// Implementations must treat the event's dedup key as a uniqueness
/// constraint, so concurrent or repeated inserts of the same logical event
/// leave exactly one row.
#[async_trait::async_trait]
pub trait UsageStoreTrait: Send + Sync {
    /// Insert an event unless one with the same dedup key exists.
    async fn insert(&self, event: &ImageUsageEvent) -> Result<InsertOutcome, StoreError>;

    /// Return every stored event in insertion order.
    async fn list(&self) -> Result<Vec<ImageUsageEvent>, StoreError>;
}

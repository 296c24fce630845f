//! Image Usage Store
//!
//! Append-only persistence for container image usage events observed by the
//! image history controller, plus the read path used by the query endpoint.
//!
//! # Example
//!
//! ```no_run
//! use usage_store::{ImageUsageEvent, PgUsageStore, UsageStoreTrait, parse_timestamp};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgUsageStore::connect("postgres://localhost/images", 5).await?;
//!
//! let event = ImageUsageEvent {
//!     pod: "web-1".to_string(),
//!     container: "app".to_string(),
//!     image: "nginx:1.25".to_string(),
//!     image_id: "sha256:abc".to_string(),
//!     namespace: "default".to_string(),
//!     started_at: parse_timestamp("2024-01-01T00:00:00Z")?,
//!     deleted_at: None,
//! };
//!
//! // Inserting the same logical event twice stores one row
//! store.insert(&event).await?;
//! store.insert(&event).await?;
//!
//! let all = store.list().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod usage_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{PgUsageStore, SCHEMA};
pub use error::StoreError;
pub use models::*;
pub use usage_trait::{InsertOutcome, UsageStoreTrait};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockUsageStore;

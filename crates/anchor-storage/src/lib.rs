//! Anchor Storage - atomic JSON document persistence.
//!
//! This crate keeps Anchor's configuration and history in one JSON document.
//! It handles:
//!
//! - Loading with a versioned schema, falling back to defaults on corruption
//! - Shallow-merge updates serialized through one writer queue
//! - Atomic replacement on disk (temp file, fsync, rename)
//! - Session history, daily totals, and streaks
//!
//! # Example
//!
//! ```no_run
//! use anchor_storage::PersistentStore;
//! use serde_json::json;
//!
//! # async fn run() -> anchor_storage::Result<()> {
//! let store = PersistentStore::open("/tmp/anchor.json").await?;
//! store.set(json!({"workMinutes": 50})).await?;
//! assert_eq!(store.get_all().work_minutes, 50);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod history;
pub mod models;
pub mod schema;
pub mod store;

pub use error::{Result, StorageError};
pub use models::{DailyStats, SessionRecord, StorageData, Streak};
pub use store::{default_data_dir, PersistentStore};

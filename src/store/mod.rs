//! Snapshot persistence.
//!
//! Two formats are kept side by side:
//!
//! - [`snapshot`]: human-readable versioned JSON files (`graph_v{N}.json`)
//! - [`durable`]: ACID snapshot table in redb, bincode-encoded

pub mod durable;
pub mod snapshot;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

//! Versioned response cache.
//!
//! A cache holds named generations of stored responses:
//! - Entries are keyed by method + URL (fragment dropped)
//! - Writes replace whole entries, never patch them
//! - A generation is deleted as a unit when a newer version activates

mod key;
mod storage;
mod types;

pub use key::CacheKey;
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{CachedEntry, Intercepted, ResponseSource, StoredResponse};

//! Generation-scoped response cache.
//!
//! Entries live in named, versioned generations (`static-v1`, `dynamic-v1`).
//! Bumping the version tag in a generation name and reconciling at
//! activation drops old entries wholesale instead of invalidating them
//! one by one, so no stale-schema entries survive a version change.

mod store;
mod traits;

pub use store::SqliteStore;
pub use traits::{CacheStore, StorageError};

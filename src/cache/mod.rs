//! Versioned cache store for offline support.
//!
//! This module provides the storage half of the worker:
//! - Named cache versions, each a key-value store of request identity to response
//! - Atomic batch writes so a precache is either complete or absent
//! - Version listing and deletion for activation cleanup
//! - The persisted registration record (active and waiting versions)

mod handle;
#[cfg(test)]
mod memory;
mod storage;
mod traits;

pub use handle::{CacheHandle, CacheStore};
#[cfg(test)]
pub use memory::MemoryStorage;
#[cfg(test)]
pub use traits::CachedEntry;
pub use storage::SqliteStorage;
pub use traits::{
  CacheStorage, CacheVersion, FetchResult, Registration, RegistrationStore, ResponseSource,
};

//! Core traits and types for the versioned cache store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::WorkerResult;
use crate::http::{RequestKey, Response};

/// Name of one generation of the precache store (e.g. "quickmeal-cache-v1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stored response together with the identity it was stored under.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub key: RequestKey,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Stable, fixed-length storage key for a request identity.
pub fn key_hash(key: &RequestKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.method.as_bytes());
  hasher.update(b" ");
  hasher.update(key.url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Trait for cache storage backends.
///
/// Implementations must tolerate concurrent `put` and `lookup` calls from
/// several in-flight fetches. The last writer wins per key.
pub trait CacheStorage: Send + Sync {
  /// Create the store for `version` if it does not exist yet.
  fn open(&self, version: &CacheVersion) -> WorkerResult<()>;

  /// Upsert one entry into an existing version store.
  ///
  /// Never creates the store: a write aimed at a version that has been deleted
  /// is dropped and reported as `false`.
  fn put(&self, version: &CacheVersion, key: &RequestKey, response: &Response) -> WorkerResult<bool>;

  /// Upsert several entries atomically: either all are committed or none are.
  /// Creates the version store if needed.
  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, Response)]) -> WorkerResult<()>;

  /// Look up an entry in exactly one version.
  fn lookup(&self, version: &CacheVersion, key: &RequestKey) -> WorkerResult<Option<CachedEntry>>;

  /// All existing version stores, sorted by name.
  fn list_versions(&self) -> WorkerResult<Vec<CacheVersion>>;

  /// Delete a version store with all of its entries. Returns false if it did not exist.
  fn delete_version(&self, version: &CacheVersion) -> WorkerResult<bool>;

  /// Number of entries stored under `version`.
  fn entry_count(&self, version: &CacheVersion) -> WorkerResult<usize>;
}

/// Which versions are in control and which one is waiting to take over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
  pub active: Option<CacheVersion>,
  pub waiting: Option<CacheVersion>,
}

/// Persistence for the registration record.
pub trait RegistrationStore: Send + Sync {
  fn registration(&self) -> WorkerResult<Registration>;

  fn set_registration(&self, registration: &Registration) -> WorkerResult<()>;
}

/// Result of a fetch handled by the worker, including where the response came from.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub source: ResponseSource,
  /// When the entry was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl FetchResult {
  /// A live network response.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// A cached entry served under `source`.
  pub fn from_cache(entry: CachedEntry, source: ResponseSource) -> Self {
    Self {
      response: entry.response,
      source,
      cached_at: Some(entry.cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live data from the network
  Network,
  /// Cache hit for a static asset
  Cache,
  /// Network failed, serving the cached copy of the same request
  OfflineCache,
  /// Network failed, serving the cached application shell
  OfflineShell,
  /// Network failed for an image, serving the cached placeholder
  Placeholder,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflineCache => "offline-cache",
      Self::OfflineShell => "offline-shell",
      Self::Placeholder => "placeholder",
    };
    f.write_str(s)
  }
}

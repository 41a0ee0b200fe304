//! Version-scoped access to the cache storage.

use std::sync::Arc;

use super::traits::{CacheStorage, CacheVersion, CachedEntry};
use crate::error::WorkerResult;
use crate::http::{Request, RequestKey, Response};

/// Entry point to the cache store: opens version handles and manages versions.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Open (creating if needed) the store for `version`.
  pub fn open(&self, version: &CacheVersion) -> WorkerResult<CacheHandle<S>> {
    self.storage.open(version)?;
    Ok(self.handle(version))
  }

  /// Handle onto `version` without creating it. Reads on a missing version miss.
  pub fn handle(&self, version: &CacheVersion) -> CacheHandle<S> {
    CacheHandle {
      storage: Arc::clone(&self.storage),
      version: version.clone(),
    }
  }

  pub fn list_versions(&self) -> WorkerResult<Vec<CacheVersion>> {
    self.storage.list_versions()
  }

  pub fn delete_version(&self, version: &CacheVersion) -> WorkerResult<bool> {
    self.storage.delete_version(version)
  }

  /// Commit a full set of entries for `version` in one transaction.
  pub fn commit(&self, version: &CacheVersion, entries: &[(RequestKey, Response)]) -> WorkerResult<()> {
    self.storage.put_all(version, entries)
  }
}

/// Reads and writes scoped to a single cache version.
pub struct CacheHandle<S: CacheStorage> {
  storage: Arc<S>,
  version: CacheVersion,
}

impl<S: CacheStorage> CacheHandle<S> {
  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  /// Upsert `response` under the identity of `request`. Returns false when
  /// this version no longer exists and the write was dropped.
  pub fn put(&self, request: &Request, response: &Response) -> WorkerResult<bool> {
    self.storage.put(&self.version, &request.key(), response)
  }

  pub fn matches(&self, request: &Request) -> WorkerResult<Option<CachedEntry>> {
    self.storage.lookup(&self.version, &request.key())
  }

  pub fn matches_key(&self, key: &RequestKey) -> WorkerResult<Option<CachedEntry>> {
    self.storage.lookup(&self.version, key)
  }
}

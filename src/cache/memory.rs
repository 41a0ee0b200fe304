//! In-memory storage for tests.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::traits::{
  key_hash, CacheStorage, CacheVersion, CachedEntry, Registration, RegistrationStore,
};
use crate::error::{WorkerError, WorkerResult};
use crate::http::{RequestKey, Response};

/// In-memory storage. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  versions: Mutex<BTreeMap<CacheVersion, HashMap<String, CachedEntry>>>,
  registration: Mutex<Registration>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn versions(&self) -> WorkerResult<MutexGuard<'_, BTreeMap<CacheVersion, HashMap<String, CachedEntry>>>> {
    self
      .versions
      .lock()
      .map_err(|e| WorkerError::storage(format!("Lock poisoned: {}", e)))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, version: &CacheVersion) -> WorkerResult<()> {
    self.versions()?.entry(version.clone()).or_default();
    Ok(())
  }

  fn put(&self, version: &CacheVersion, key: &RequestKey, response: &Response) -> WorkerResult<bool> {
    let mut versions = self.versions()?;
    let Some(store) = versions.get_mut(version) else {
      return Ok(false);
    };
    let entry = CachedEntry {
      key: key.clone(),
      response: response.clone(),
      cached_at: Utc::now(),
    };
    store.insert(key_hash(key), entry);
    Ok(true)
  }

  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, Response)]) -> WorkerResult<()> {
    // One lock for the whole batch so no reader sees a partial set
    let mut versions = self.versions()?;
    let store = versions.entry(version.clone()).or_default();
    let now = Utc::now();
    for (key, response) in entries {
      store.insert(
        key_hash(key),
        CachedEntry {
          key: key.clone(),
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn lookup(&self, version: &CacheVersion, key: &RequestKey) -> WorkerResult<Option<CachedEntry>> {
    Ok(
      self
        .versions()?
        .get(version)
        .and_then(|store| store.get(&key_hash(key)))
        .cloned(),
    )
  }

  fn list_versions(&self) -> WorkerResult<Vec<CacheVersion>> {
    Ok(self.versions()?.keys().cloned().collect())
  }

  fn delete_version(&self, version: &CacheVersion) -> WorkerResult<bool> {
    Ok(self.versions()?.remove(version).is_some())
  }

  fn entry_count(&self, version: &CacheVersion) -> WorkerResult<usize> {
    Ok(self.versions()?.get(version).map(|s| s.len()).unwrap_or(0))
  }
}

impl RegistrationStore for MemoryStorage {
  fn registration(&self) -> WorkerResult<Registration> {
    self
      .registration
      .lock()
      .map(|r| r.clone())
      .map_err(|e| WorkerError::storage(format!("Lock poisoned: {}", e)))
  }

  fn set_registration(&self, registration: &Registration) -> WorkerResult<()> {
    let mut current = self
      .registration
      .lock()
      .map_err(|e| WorkerError::storage(format!("Lock poisoned: {}", e)))?;
    *current = registration.clone();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    RequestKey::new("GET", &url)
  }

  fn response(path: &str, body: &str) -> Response {
    Response::new(format!("http://localhost:3000{}", path), 200, body)
  }

  #[test]
  fn test_last_writer_wins_per_key() {
    let storage = MemoryStorage::new();
    let v1 = CacheVersion::new("v1");
    storage.open(&v1).unwrap();

    assert!(storage.put(&v1, &key("/a.css"), &response("/a.css", "1")).unwrap());
    assert!(storage.put(&v1, &key("/a.css"), &response("/a.css", "2")).unwrap());

    assert_eq!(storage.entry_count(&v1).unwrap(), 1);
    let entry = storage.lookup(&v1, &key("/a.css")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"2");
    assert!(storage.delete_version(&v1).unwrap());
    assert!(storage.list_versions().unwrap().is_empty());
  }

  #[test]
  fn test_put_into_deleted_version_is_dropped() {
    let storage = MemoryStorage::new();
    let v0 = CacheVersion::new("v0");
    storage.open(&v0).unwrap();
    storage.delete_version(&v0).unwrap();

    assert!(!storage.put(&v0, &key("/late.js"), &response("/late.js", "late")).unwrap());
    assert!(storage.list_versions().unwrap().is_empty());
    assert!(storage.lookup(&v0, &key("/late.js")).unwrap().is_none());
  }
}

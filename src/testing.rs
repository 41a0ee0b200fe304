//! Test doubles for the network layer and the cache storage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use crate::cache::{
  CacheStorage, CacheVersion, CachedEntry, MemoryStorage, Registration, RegistrationStore,
};
use crate::error::{NetworkError, WorkerError, WorkerResult};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

pub const ORIGIN: &str = "http://localhost:3000";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Scripted network: serves registered responses, fails everything else,
/// and counts calls.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  failing: Mutex<Vec<String>>,
  held: Mutex<HashMap<String, Arc<Notify>>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `body` with status 200 at `path`.
  pub fn serve(&self, path: &str, body: &str) -> &Self {
    self.respond(path, Response::new(url(path).as_str(), 200, body))
  }

  pub fn respond(&self, path: &str, response: Response) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url(path).to_string(), response);
    self
  }

  /// Make requests for `path` fail at the transport level.
  pub fn fail(&self, path: &str) -> &Self {
    self.failing.lock().unwrap().push(url(path).to_string());
    self
  }

  /// Keep the next request for `path` in flight until `release` is called.
  pub fn hold(&self, path: &str) -> &Self {
    self
      .held
      .lock()
      .unwrap()
      .insert(url(path).to_string(), Arc::new(Notify::new()));
    self
  }

  pub fn release(&self, path: &str) {
    if let Some(gate) = self.held.lock().unwrap().remove(&url(path).to_string()) {
      gate.notify_one();
    }
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn reset_calls(&self) {
    self.calls.store(0, Ordering::SeqCst);
  }

  /// Yield until at least `n` requests have reached the network.
  pub async fn wait_for_calls(&self, n: usize) {
    while self.calls() < n {
      tokio::task::yield_now().await;
    }
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;

    let key = request.url.to_string();
    let gate = self.held.lock().unwrap().get(&key).cloned();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
      return Err(NetworkError::Unreachable {
        url: key,
        reason: "offline".to_string(),
      });
    }

    let route = self.routes.lock().unwrap().get(&key).cloned();
    Ok(route.unwrap_or_else(|| Response::new(key, 404, "404 Not Found")))
  }
}

/// Storage whose single-entry writes always fail. Batch writes, reads and
/// version management go to an in-memory store.
#[derive(Default)]
pub struct FailingPutStorage {
  inner: MemoryStorage,
  put_attempts: AtomicUsize,
}

impl FailingPutStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put_attempts(&self) -> usize {
    self.put_attempts.load(Ordering::SeqCst)
  }
}

impl CacheStorage for FailingPutStorage {
  fn open(&self, version: &CacheVersion) -> WorkerResult<()> {
    self.inner.open(version)
  }

  fn put(&self, _version: &CacheVersion, key: &RequestKey, _response: &Response) -> WorkerResult<bool> {
    self.put_attempts.fetch_add(1, Ordering::SeqCst);
    Err(WorkerError::storage(format!("disk full while storing {}", key)))
  }

  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, Response)]) -> WorkerResult<()> {
    self.inner.put_all(version, entries)
  }

  fn lookup(&self, version: &CacheVersion, key: &RequestKey) -> WorkerResult<Option<CachedEntry>> {
    self.inner.lookup(version, key)
  }

  fn list_versions(&self) -> WorkerResult<Vec<CacheVersion>> {
    self.inner.list_versions()
  }

  fn delete_version(&self, version: &CacheVersion) -> WorkerResult<bool> {
    self.inner.delete_version(version)
  }

  fn entry_count(&self, version: &CacheVersion) -> WorkerResult<usize> {
    self.inner.entry_count(version)
  }
}

impl RegistrationStore for FailingPutStorage {
  fn registration(&self) -> WorkerResult<Registration> {
    self.inner.registration()
  }

  fn set_registration(&self, registration: &Registration) -> WorkerResult<()> {
    self.inner.set_registration(registration)
  }
}

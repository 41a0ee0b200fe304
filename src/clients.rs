//! Registry of open client contexts (tabs) and the version controlling each.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::cache::CacheVersion;

/// Identifier of an open page.
pub type ClientId = u64;

/// Client registry consulted by the lifecycle controller.
pub trait ClientRegistry: Send + Sync {
  /// Make `version` the controller of every open client. Returns how many changed hands.
  fn claim_all(&self, version: &CacheVersion) -> usize;

  /// Number of open clients still controlled by a version other than `version`.
  fn controlled_by_other(&self, version: &CacheVersion) -> usize;
}

/// In-process client registry.
#[derive(Default)]
pub struct LocalClients {
  clients: Mutex<BTreeMap<ClientId, Option<CacheVersion>>>,
  next_id: AtomicU64,
}

impl LocalClients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry holding the calling process as one open page, controlled by
  /// `controller` (the version active when the process started).
  pub fn with_page(controller: Option<CacheVersion>) -> Self {
    let clients = Self::new();
    let id = clients.connect(controller);
    debug!(id, "registered this process as a client");
    clients
  }

  /// Register an open page, optionally already controlled by `controller`.
  pub fn connect(&self, controller: Option<CacheVersion>) -> ClientId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    self.with_clients(|clients| {
      clients.insert(id, controller);
    });
    id
  }

  /// Close a page.
  #[cfg(test)]
  pub fn disconnect(&self, id: ClientId) {
    self.with_clients(|clients| {
      clients.remove(&id);
    });
  }

  #[cfg(test)]
  pub fn controller(&self, id: ClientId) -> Option<CacheVersion> {
    self.with_clients(|clients| clients.get(&id).cloned().flatten())
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.with_clients(|clients| clients.len())
  }

  fn with_clients<T>(&self, f: impl FnOnce(&mut BTreeMap<ClientId, Option<CacheVersion>>) -> T) -> T {
    match self.clients.lock() {
      Ok(mut clients) => f(&mut clients),
      Err(poisoned) => f(&mut poisoned.into_inner()),
    }
  }
}

impl ClientRegistry for LocalClients {
  fn claim_all(&self, version: &CacheVersion) -> usize {
    self.with_clients(|clients| {
      let mut claimed = 0;
      for controller in clients.values_mut() {
        if controller.as_ref() != Some(version) {
          *controller = Some(version.clone());
          claimed += 1;
        }
      }
      debug!(%version, claimed, "claimed clients");
      claimed
    })
  }

  fn controlled_by_other(&self, version: &CacheVersion) -> usize {
    self.with_clients(|clients| {
      clients
        .values()
        .filter(|c| matches!(c, Some(v) if v != version))
        .count()
    })
  }
}

//! Out-of-band signals: client messages and deferred background sync.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::WorkerResult;

/// Messages a page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  /// Promote a waiting version to active without waiting for old pages to close
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

impl ClientMessage {
  /// Parse a posted message. Anything unrecognized yields `None` and is ignored.
  pub fn parse(data: &Value) -> Option<Self> {
    match serde_json::from_value(data.clone()) {
      Ok(message) => Some(message),
      Err(e) => {
        debug!(%data, error = %e, "ignoring unrecognized message");
        None
      }
    }
  }
}

/// Deferred sync tags understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTag {
  Favorites,
}

impl SyncTag {
  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "sync-favorites" => Some(Self::Favorites),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Favorites => "sync-favorites",
    }
  }
}

/// Sync tags requested while offline, delivered once connectivity returns.
#[derive(Default)]
pub struct SyncRegistry {
  pending: Mutex<BTreeSet<String>>,
}

impl SyncRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Remember `tag`. Requesting the same tag twice delivers it once.
  pub fn request(&self, tag: &str) {
    match self.pending.lock() {
      Ok(mut pending) => pending.insert(tag.to_string()),
      Err(poisoned) => poisoned.into_inner().insert(tag.to_string()),
    };
  }

  /// Drain every pending tag.
  pub fn connectivity_restored(&self) -> Vec<String> {
    let mut pending = match self.pending.lock() {
      Ok(pending) => pending,
      Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::take(&mut *pending).into_iter().collect()
  }

  #[cfg(test)]
  pub fn is_pending(&self, tag: &str) -> bool {
    match self.pending.lock() {
      Ok(pending) => pending.contains(tag),
      Err(poisoned) => poisoned.into_inner().contains(tag),
    }
  }
}

/// Push locally stored favorites to the server.
///
/// There is no server endpoint yet, so this only logs and always succeeds.
pub async fn sync_favorites() -> WorkerResult<()> {
  info!("syncing favorites");
  Ok(())
}

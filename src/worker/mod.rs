//! The offline worker: lifecycle, fetch interception and the message/sync hook,
//! assembled from injected collaborators.

mod fetch;
mod lifecycle;
mod messages;

pub use fetch::{FetchInterceptor, FetchOutcome};
pub use lifecycle::{ClaimPolicy, Lifecycle, WorkerState};
pub use messages::{sync_favorites, ClientMessage, SyncRegistry, SyncTag};

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use url::{Origin, Url};

use crate::cache::{CacheStorage, CacheVersion, RegistrationStore};
use crate::clients::ClientRegistry;
use crate::error::WorkerResult;
use crate::http::Request;
use crate::manifest::AssetManifest;
use crate::network::Network;

/// Everything that identifies one deployment of the worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub version: CacheVersion,
  pub origin: Url,
  pub manifest: AssetManifest,
  /// Document served to offline navigations with no cached copy
  pub offline_shell: Url,
  /// Image served when an image request fails offline
  pub image_placeholder: Url,
  pub claim_policy: ClaimPolicy,
  /// Origins other than `origin` whose GET requests are intercepted
  pub intercept_origins: Vec<Origin>,
}

/// One version of the worker.
pub struct ServiceWorker<S, N, C>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
  C: ClientRegistry,
{
  lifecycle: Lifecycle<S, N, C>,
  interceptor: FetchInterceptor<S, N>,
  syncs: SyncRegistry,
}

impl<S, N, C> ServiceWorker<S, N, C>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
  C: ClientRegistry,
{
  pub fn new(
    options: WorkerOptions,
    storage: Arc<S>,
    network: Arc<N>,
    clients: Arc<C>,
  ) -> WorkerResult<Self> {
    let interceptor = FetchInterceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &options.origin,
      options.intercept_origins,
      &options.offline_shell,
      &options.image_placeholder,
    );
    let lifecycle = Lifecycle::new(
      storage,
      network,
      clients,
      options.manifest,
      options.version,
      options.claim_policy,
    )?;

    Ok(Self {
      lifecycle,
      interceptor,
      syncs: SyncRegistry::new(),
    })
  }

  pub fn version(&self) -> &CacheVersion {
    self.lifecycle.version()
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  /// Install, then activate if allowed.
  pub async fn register(&self) -> WorkerResult<WorkerState> {
    self.lifecycle.register().await
  }

  /// Activate a version that is installed and waiting.
  pub fn activate(&self) -> WorkerResult<WorkerState> {
    self.lifecycle.activate()?;
    Ok(self.lifecycle.state())
  }

  pub async fn fetch(&self, request: &Request) -> WorkerResult<FetchOutcome> {
    self.interceptor.handle(request).await
  }

  /// Handle a message posted by a page.
  pub fn on_message(&self, data: &Value) -> WorkerResult<WorkerState> {
    match ClientMessage::parse(data) {
      Some(ClientMessage::SkipWaiting) => {
        info!(version = %self.version(), "skip waiting requested");
        self.lifecycle.skip_waiting()
      }
      None => Ok(self.lifecycle.state()),
    }
  }

  /// Ask for `tag` to be synced once connectivity returns.
  pub fn request_sync(&self, tag: &str) {
    debug!(tag, "sync requested");
    self.syncs.request(tag);
  }

  /// Run the routines for every tag requested while offline.
  ///
  /// Returns the recognized tags that ran. Sync failures are logged and dropped.
  pub async fn connectivity_restored(&self) -> Vec<SyncTag> {
    let mut ran = Vec::new();
    for tag in self.syncs.connectivity_restored() {
      if let Some(tag) = self.on_sync(&tag).await {
        ran.push(tag);
      }
    }
    ran
  }

  /// Dispatch a single sync tag delivered by the runtime.
  pub async fn on_sync(&self, tag: &str) -> Option<SyncTag> {
    let Some(sync) = SyncTag::parse(tag) else {
      debug!(tag, "ignoring unknown sync tag");
      return None;
    };

    let result = match sync {
      SyncTag::Favorites => sync_favorites().await,
    };
    if let Err(e) = result {
      info!(tag, error = %e, "sync failed");
    }
    Some(sync)
  }
}

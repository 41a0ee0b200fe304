//! Install and activate: bringing a new cache version online and retiring old ones.

use futures::future::try_join_all;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::cache::{CacheStorage, CacheStore, CacheVersion, Registration, RegistrationStore};
use crate::clients::ClientRegistry;
use crate::error::{WorkerError, WorkerResult};
use crate::manifest::AssetManifest;
use crate::network::Network;

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Unregistered,
  Installing,
  /// Precache committed, waiting to take control
  Installed,
  Activating,
  Activated,
  /// Install failed; this version will never take control
  Redundant,
}

/// How a freshly installed version takes over from its predecessor.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClaimPolicy {
  /// Skip the waiting phase and claim every open client on activation.
  /// Pages opened under the old version may briefly run against the new cache.
  #[default]
  Forced,
  /// Activate only once no client is controlled by an older version, and
  /// leave existing clients alone.
  Gated,
}

/// Drives install and activation for a single cache version.
pub struct Lifecycle<S, N, C>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
  C: ClientRegistry,
{
  store: CacheStore<S>,
  registry: Arc<S>,
  network: Arc<N>,
  clients: Arc<C>,
  manifest: AssetManifest,
  version: CacheVersion,
  policy: ClaimPolicy,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl<S, N, C> Lifecycle<S, N, C>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
  C: ClientRegistry,
{
  /// Create the controller, restoring its state from the registration record.
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    clients: Arc<C>,
    manifest: AssetManifest,
    version: CacheVersion,
    policy: ClaimPolicy,
  ) -> WorkerResult<Self> {
    let registration = storage.registration()?;
    let state = if registration.active.as_ref() == Some(&version) {
      WorkerState::Activated
    } else if registration.waiting.as_ref() == Some(&version) {
      WorkerState::Installed
    } else {
      WorkerState::Unregistered
    };
    debug!(%version, ?state, "restored worker state");

    Ok(Self {
      store: CacheStore::new(Arc::clone(&storage)),
      registry: storage,
      network,
      clients,
      manifest,
      version,
      policy,
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(policy == ClaimPolicy::Forced),
    })
  }

  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_state(&self, next: WorkerState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    debug!(version = %self.version, from = ?*state, to = ?next, "state transition");
    *state = next;
  }

  /// Move from `from` to `to` only if the current state is one of `from`.
  fn transition(&self, from: &[WorkerState], to: WorkerState) -> bool {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    if from.contains(&state) {
      *state = to;
      true
    } else {
      false
    }
  }

  /// Precache every manifest entry under this version.
  ///
  /// All entries are fetched before anything is written, and the write is a
  /// single transaction. Any failure leaves the store and the active version
  /// exactly as they were.
  pub async fn install(&self) -> WorkerResult<()> {
    if !self.transition(
      &[WorkerState::Unregistered, WorkerState::Redundant],
      WorkerState::Installing,
    ) {
      debug!(version = %self.version, state = ?self.state(), "install skipped");
      return Ok(());
    }

    info!(version = %self.version, assets = self.manifest.len(), "installing");

    match self.precache().await {
      Ok(()) => {
        let mut registration = self.registry.registration()?;
        if registration.active.as_ref() != Some(&self.version) {
          registration.waiting = Some(self.version.clone());
          self.registry.set_registration(&registration)?;
        }
        self.set_state(WorkerState::Installed);
        info!(version = %self.version, "installed");
        Ok(())
      }
      Err(e) => {
        error!(version = %self.version, error = %e, "install failed, keeping previous version");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> WorkerResult<()> {
    let fetches = self.manifest.requests().map(|request| {
      let network = Arc::clone(&self.network);
      async move {
        let response = network
          .fetch(&request)
          .await
          .map_err(|e| WorkerError::InstallFailure {
            url: request.url.to_string(),
            reason: e.to_string(),
          })?;
        if !response.ok() {
          return Err(WorkerError::InstallFailure {
            url: request.url.to_string(),
            reason: format!("status {}", response.status),
          });
        }
        Ok((request.key(), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.store.commit(&self.version, &entries)
  }

  /// Whether an installed version may take control now.
  pub fn ready_to_activate(&self) -> bool {
    self.state() == WorkerState::Installed
      && (self.skip_waiting.load(Ordering::SeqCst)
        || self.clients.controlled_by_other(&self.version) == 0)
  }

  /// Take control: delete every other cache version and record this one as active.
  pub fn activate(&self) -> WorkerResult<()> {
    if self.state() == WorkerState::Activated {
      return Ok(());
    }
    if !self.transition(&[WorkerState::Installed], WorkerState::Activating) {
      return Err(WorkerError::InvalidState(format!(
        "cannot activate {} from {:?}",
        self.version,
        self.state()
      )));
    }

    info!(version = %self.version, "activating");

    if let Err(e) = self.retire_and_promote() {
      self.set_state(WorkerState::Installed);
      return Err(e);
    }

    self.set_state(WorkerState::Activated);

    if self.policy == ClaimPolicy::Forced {
      let claimed = self.clients.claim_all(&self.version);
      info!(version = %self.version, claimed, "claimed open clients");
    }

    Ok(())
  }

  fn retire_and_promote(&self) -> WorkerResult<()> {
    // Fetch writes only land in a version that exists
    self.store.open(&self.version)?;
    for stale in self.store.list_versions()? {
      if stale != self.version {
        info!(cache = %stale, "removing old cache");
        self.store.delete_version(&stale)?;
      }
    }

    self.registry.set_registration(&Registration {
      active: Some(self.version.clone()),
      waiting: None,
    })
  }

  /// Stop waiting for old clients to close. Activates right away if installed.
  pub fn skip_waiting(&self) -> WorkerResult<WorkerState> {
    self.skip_waiting.store(true, Ordering::SeqCst);
    if self.state() == WorkerState::Installed {
      self.activate()?;
    }
    Ok(self.state())
  }

  /// Install if needed, then activate if the waiting gate allows it.
  pub async fn register(&self) -> WorkerResult<WorkerState> {
    if matches!(
      self.state(),
      WorkerState::Unregistered | WorkerState::Redundant
    ) {
      self.install().await?;
    }
    if self.ready_to_activate() {
      self.activate()?;
    } else if self.state() == WorkerState::Installed {
      info!(version = %self.version, "installed, waiting for old clients to close");
    }
    Ok(self.state())
  }
}

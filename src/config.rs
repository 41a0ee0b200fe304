use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheVersion;
use crate::manifest::{AssetManifest, DEFAULT_ASSETS};
use crate::worker::{ClaimPolicy, WorkerOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app is served from (e.g. "http://localhost:3000")
  pub origin: String,
  /// Name of the current cache generation; bump it to roll out new assets
  pub cache_version: String,
  /// forced: take over open pages immediately; gated: wait for them to close
  pub claim_policy: ClaimPolicy,
  pub offline_shell: String,
  pub image_placeholder: String,
  /// Paths precached on install
  pub assets: Vec<String>,
  /// Additional origins to intercept (cross-origin requests pass through otherwise)
  pub intercept_origins: Vec<String>,
  /// Cache database location (defaults to the platform data directory)
  pub cache_path: Option<PathBuf>,
  pub network_timeout_secs: Option<u64>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache_version: "quickmeal-cache-v1".to_string(),
      claim_policy: ClaimPolicy::default(),
      offline_shell: "/index.html".to_string(),
      image_placeholder: "/assets/images/placeholder.png".to_string(),
      assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
      intercept_origins: Vec::new(),
      cache_path: None,
      network_timeout_secs: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./quickmeal-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/quickmeal-sw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("quickmeal-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("quickmeal-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("Origin '{}' cannot be used as a base URL", self.origin));
    }
    Ok(url)
  }

  pub fn network_timeout(&self) -> Option<Duration> {
    self.network_timeout_secs.map(Duration::from_secs)
  }

  /// Resolve paths and origins into the options the worker runs with.
  pub fn worker_options(&self) -> Result<WorkerOptions> {
    let origin = self.origin_url()?;

    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
    };

    let manifest = AssetManifest::new(&origin, &self.assets, &self.offline_shell)?;

    let intercept_origins = self
      .intercept_origins
      .iter()
      .map(|o| {
        Url::parse(o)
          .map(|u| u.origin())
          .map_err(|e| eyre!("Invalid intercept origin '{}': {}", o, e))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(WorkerOptions {
      version: CacheVersion::new(&self.cache_version),
      offline_shell: resolve(&self.offline_shell)?,
      image_placeholder: resolve(&self.image_placeholder)?,
      manifest,
      claim_policy: self.claim_policy,
      intercept_origins,
      origin,
    })
  }
}

//! The list of assets precached at install time.

use url::Url;

use crate::error::{WorkerError, WorkerResult};
use crate::http::Request;

/// Assets the QuickMeal shell needs to work offline.
pub const DEFAULT_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/manifest.json",
  "/css/main.css",
  "/css/utilities.css",
  "/js/app.js",
  "/js/utils/helpers.js",
  "/js/data/recipeData.js",
  "/js/components/recipeCard.js",
  "/js/components/recipeDetail.js",
  "/js/components/filterSystem.js",
  "/assets/data/recipes.json",
];

/// Ordered list of same-origin URLs that must all be cached before install completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
  urls: Vec<Url>,
}

impl AssetManifest {
  /// Resolve `paths` against `origin` and validate the result.
  ///
  /// The manifest must be non-empty, contain `shell`, and stay on `origin`.
  pub fn new<P: AsRef<str>>(origin: &Url, paths: &[P], shell: &str) -> WorkerResult<Self> {
    if paths.is_empty() {
      return Err(WorkerError::InvalidManifest("no assets listed".to_string()));
    }

    let mut urls = Vec::with_capacity(paths.len());
    for path in paths {
      let path = path.as_ref();
      let url = origin
        .join(path)
        .map_err(|e| WorkerError::InvalidManifest(format!("bad asset path '{}': {}", path, e)))?;
      if url.origin() != origin.origin() {
        return Err(WorkerError::InvalidManifest(format!(
          "asset '{}' is not on {}",
          path,
          origin.origin().ascii_serialization()
        )));
      }
      if !urls.contains(&url) {
        urls.push(url);
      }
    }

    let shell_url = origin
      .join(shell)
      .map_err(|e| WorkerError::InvalidManifest(format!("bad shell path '{}': {}", shell, e)))?;
    if !urls.contains(&shell_url) {
      return Err(WorkerError::InvalidManifest(format!(
        "offline shell '{}' is not precached",
        shell
      )));
    }

    Ok(Self { urls })
  }

  pub fn len(&self) -> usize {
    self.urls.len()
  }

  /// Requests issued for each entry during precache.
  pub fn requests(&self) -> impl Iterator<Item = Request> + '_ {
    self.urls.iter().cloned().map(Request::asset)
  }
}

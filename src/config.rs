use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Upstream origin requests are issued against (e.g. "https://shop.example.com")
  pub origin: String,

  /// Version tag baked into generation names; bumping it invalidates all
  /// cached entries wholesale at the next activation
  #[serde(default = "default_version")]
  pub version: String,

  /// Path prefix that routes a request to the network-first policy
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,

  /// Pages and assets cached immediately at install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,

  /// API path prefixes that get a synthesized 503 when offline with no
  /// cached copy; everything else propagates the failure
  #[serde(default = "default_critical_api")]
  pub critical_api: Vec<String>,

  /// Page served as the navigation fallback of last resort before the
  /// synthesized offline page
  #[serde(default = "default_root_page")]
  pub root_page: String,

  /// Resource classes the sync queue accepts drain signals for
  #[serde(default = "default_sync_classes")]
  pub sync_classes: Vec<String>,
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_precache() -> Vec<String> {
  vec![
    "/".to_string(),
    "/sign-in".to_string(),
    "/sign-up".to_string(),
    "/manifest.json".to_string(),
    "/icons/icon-192x192.png".to_string(),
    "/icons/icon-512x512.png".to_string(),
  ]
}

fn default_critical_api() -> Vec<String> {
  vec![
    "/api/products".to_string(),
    "/api/inventory".to_string(),
    "/api/customers".to_string(),
    "/api/shop".to_string(),
  ]
}

fn default_root_page() -> String {
  "/".to_string()
}

fn default_sync_classes() -> Vec<String> {
  vec!["sales".to_string(), "inventory".to_string()]
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shopflow-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shopflow-offline/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shopflow-offline/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shopflow-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shopflow-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parsed upstream origin.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Name of the current static-assets generation.
  pub fn static_generation(&self) -> String {
    format!("static-{}", self.version)
  }

  /// Name of the current dynamic/API generation.
  pub fn dynamic_generation(&self) -> String {
    format!("dynamic-{}", self.version)
  }

  /// The generations activation keeps; everything else is reconciled away.
  pub fn current_generations(&self) -> Vec<String> {
    vec![self.static_generation(), self.dynamic_generation()]
  }
}

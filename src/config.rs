use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::Partition;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the dispatch client is served from; requests to it are same-origin
  pub origin: String,
  /// Path prefix of the remote API
  pub api_prefix: String,
  /// Path fragment identifying an assignment fetch
  pub assignment_path: String,
  /// Path the cached assignment fallback is stored under
  pub cached_assignment_path: String,
  /// Host fragment identifying tile-imagery requests
  pub tile_host_pattern: String,
  /// Tile URL template with `{s}`, `{z}`, `{x}` and `{y}` placeholders
  pub tile_url_template: String,
  /// Subdomain substituted for `{s}`
  pub tile_subdomain: String,
  /// Page served to navigations that fail while offline
  pub offline_page: String,
  /// Endpoint buffered location samples are replayed to
  pub location_endpoint: String,
  pub cache: CacheConfig,
  /// Assets fetched into the static partition on install
  pub precache: Vec<String>,
  pub prefetch: PrefetchConfig,
  pub probe: ProbeConfig,
  /// SQLite file holding the cache and the durable partitions
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace of the static/API partition; bump it to retire old entries
  pub static_name: String,
  /// Namespace of the tile partition
  pub tile_name: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_name: "ers-ambulance-app-v1".to_string(),
      tile_name: "map-tiles-cache".to_string(),
    }
  }
}

impl CacheConfig {
  /// Namespace backing a cache partition.
  pub fn namespace(&self, partition: Partition) -> &str {
    match partition {
      Partition::Static => &self.static_name,
      Partition::Tile => &self.tile_name,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  /// Upper bound on tiles fetched per prefetch
  pub max_tiles: usize,
  /// Tiles fetched in parallel
  pub concurrency: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      max_tiles: 200,
      concurrency: 8,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
  /// Seconds between connectivity probes in watch mode
  pub interval_secs: u64,
  /// Path probed on the origin
  pub path: String,
}

impl Default for ProbeConfig {
  fn default() -> Self {
    Self {
      interval_secs: 15,
      path: "/".to_string(),
    }
  }
}

const DEFAULT_ORIGIN: &str = "http://localhost:5000";

const DEFAULT_PRECACHE: &[&str] = &[
  "/frontend/ambulance_app/index.html",
  "/frontend/ambulance_app/css/styles.css",
  "/frontend/ambulance_app/js/app.js",
  "/frontend/ambulance_app/offline.html",
  "/frontend/ambulance_app/images/ambulance-marker.png",
  "/frontend/ambulance_app/images/emergency-marker.png",
  "/frontend/ambulance_app/images/offline-map.png",
  "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.7.1/leaflet.css",
  "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.7.1/leaflet.js",
  "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.7.1/images/marker-icon.png",
  "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.7.1/images/marker-shadow.png",
  "https://cdnjs.cloudflare.com/ajax/libs/socket.io/4.0.1/socket.io.min.js",
];

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: DEFAULT_ORIGIN.to_string(),
      api_prefix: "/api/".to_string(),
      assignment_path: "/get-assignment/".to_string(),
      cached_assignment_path: "/api/ambulance/cached-assignment".to_string(),
      tile_host_pattern: "tile.openstreetmap.org".to_string(),
      tile_url_template: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
      tile_subdomain: "a".to_string(),
      offline_page: "/frontend/ambulance_app/offline.html".to_string(),
      location_endpoint: "/api/ambulance/update-location".to_string(),
      cache: CacheConfig::default(),
      precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
      prefetch: PrefetchConfig::default(),
      probe: ProbeConfig::default(),
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ers-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ers-offline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ers-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ers-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse configuration from YAML text.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// The configured origin as a URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the configured origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path_or_url)
      .map_err(|e| eyre!("Invalid URL {}: {}", path_or_url, e))
  }

  /// Directory holding the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ers-offline"))
  }

  /// Database path, honouring an explicit `database` entry.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("offline.db")),
    }
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site origin that same-origin paths resolve against (e.g. https://example.com)
  pub origin: Url,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Page served for failed navigations with no cache entry
  #[serde(default = "default_offline_url")]
  pub offline_url: String,
  /// Seconds between install attempts after a failed install
  #[serde(default = "default_install_retry_secs")]
  pub install_retry_secs: u64,
  pub cache: CacheConfig,
  /// URLs populated into the cache generation at install time
  #[serde(default)]
  pub precache: Vec<String>,
  /// Hosts whose traffic never touches the cache (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub excluded_hosts: BTreeSet<String>,
  /// Cross-origin resources whose origins may be cached at runtime
  #[serde(default)]
  pub cdn_allowlist: Vec<String>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache generation name; changing it invalidates every older generation
  pub version: String,
  /// SQLite database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for rolling log files (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_offline_url() -> String {
  "/offline.html".to_string()
}

fn default_install_retry_secs() -> u64 {
  60
}

fn default_log_level() -> String {
  "info".to_string()
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.trim().to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./folio-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/folio-sw/config.yaml
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
        "No configuration file found. Create one at ~/.config/folio-sw/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("folio-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("folio-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate configuration from a YAML string.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host_str().is_none() {
      return Err(eyre!(
        "origin must be an absolute http(s) URL, got {}",
        self.origin
      ));
    }

    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }

    if !self.offline_url.starts_with('/') {
      return Err(eyre!(
        "offline_url must be a same-origin path, got {}",
        self.offline_url
      ));
    }

    for entry in &self.cdn_allowlist {
      Url::parse(entry).map_err(|e| eyre!("Invalid cdn_allowlist entry {}: {}", entry, e))?;
    }

    Ok(())
  }

  /// Resolve the cache database path, falling back to the data directory.
  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("cache.db")),
    }
  }

  /// Resolve the log directory, falling back to the data directory.
  pub fn log_directory(&self) -> Result<PathBuf> {
    match &self.log.directory {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("logs")),
    }
  }
}

fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("folio-sw"))
}

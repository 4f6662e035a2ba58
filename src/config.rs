use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_FRESHNESS_HOURS;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Value of the X-RapidAPI-Host header
  pub host: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://mangaverse-api.p.rapidapi.com/manga".to_string(),
      host: "mangaverse-api.p.rapidapi.com".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false every request goes to the network and nothing is stored
  pub enabled: bool,
  /// How long a stored response is served without re-fetching
  pub freshness_hours: i64,
  /// Database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Clear every stored response before running a command
  pub clear_on_start: bool,
}

impl CacheConfig {
  /// The freshness window as a duration.
  pub fn freshness(&self) -> Result<Duration> {
    Duration::try_hours(self.freshness_hours)
      .ok_or_else(|| eyre!("cache.freshness_hours is too large (got {})", self.freshness_hours))
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      freshness_hours: DEFAULT_FRESHNESS_HOURS,
      path: None,
      clear_on_start: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive; RUST_LOG takes precedence
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mangashelf.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mangashelf/config.yaml
  ///
  /// Without a file the defaults are used.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mangashelf.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mangashelf").join("config.yaml");
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
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.freshness_hours < 0 {
      return Err(eyre!(
        "cache.freshness_hours must not be negative (got {})",
        self.cache.freshness_hours
      ));
    }
    self.cache.freshness()?;
    if self.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    Ok(())
  }

  /// Get the RapidAPI key from environment variables.
  ///
  /// Checks MANGASHELF_API_KEY first, then RAPIDAPI_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("MANGASHELF_API_KEY")
      .or_else(|_| std::env::var("RAPIDAPI_KEY"))
      .map_err(|_| {
        eyre!("RapidAPI key not found. Set MANGASHELF_API_KEY or RAPIDAPI_KEY environment variable.")
      })
  }
}

use newsdesk_api::{ClientOptions, RetryConfig, DEFAULT_API_BASE, DEFAULT_REFRESH_PATH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var that overrides `api.base_url`
pub const API_URL_ENV: &str = "NEWSDESK_API_URL";

/// Main configuration structure
///
/// This gets loaded from config file, env vars, and CLI args.
/// Priority: CLI > Env > File > Defaults (like a sensible person would do)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load config from default location, then apply env overrides
    pub fn load() -> crate::Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load from a specific file. Missing file means defaults.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            // No config file? Use defaults
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| crate::Error::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment overrides; `lookup` is `std::env::var` outside tests
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.api.base_url = url;
        }
    }

    /// Get the config file path
    /// Uses XDG on Linux/macOS, AppData on Windows
    pub fn config_path() -> crate::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| crate::Error::ConfigError("Could not find config directory".into()))?
            .join("newsdesk");

        Ok(config_dir.join("config.toml"))
    }

    /// Where the payload cache lives unless overridden
    pub fn cache_path(&self) -> crate::Result<PathBuf> {
        if let Some(path) = &self.cache.path {
            return Ok(path.clone());
        }

        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| crate::Error::ConfigError("Could not find cache directory".into()))?
            .join("newsdesk");

        Ok(cache_dir.join("payloads.db"))
    }

    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::with_base_url(self.api.base_url.clone());
        options.connect_timeout = Duration::from_secs(self.api.connect_timeout_secs);
        options.request_timeout = Duration::from_secs(self.api.request_timeout_secs);
        if let Some(agent) = &self.api.user_agent {
            options.user_agent = agent.clone();
        }
        options
    }

    pub fn background_retry(&self) -> RetryConfig {
        self.sync.background_retry()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Backend root, e.g. http://localhost:8000
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole request, body included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Off means an in-memory cache that dies with the process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override for the SQLite file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// `cache prune` drops entries older than this
    #[serde(default = "default_max_age")]
    pub max_age_hours: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_age() -> u64 {
    24 * 7 // a week of offline reading
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_age_hours: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Refresh cached data in the background after showing it
    #[serde(default = "default_true")]
    pub refresh_in_background: bool,

    #[serde(default = "default_background_retries")]
    pub background_max_retries: u32,

    #[serde(default = "default_background_initial")]
    pub background_initial_delay_ms: u64,

    #[serde(default = "default_background_max")]
    pub background_max_delay_ms: u64,
}

fn default_background_retries() -> u32 {
    2
}

fn default_background_initial() -> u64 {
    1000
}

fn default_background_max() -> u64 {
    30000
}

impl SyncConfig {
    pub fn background_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.background_max_retries,
            initial_delay_ms: self.background_initial_delay_ms,
            max_delay_ms: self.background_max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_in_background: true,
            background_max_retries: default_background_retries(),
            background_initial_delay_ms: default_background_initial(),
            background_max_delay_ms: default_background_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Identity provider endpoint that swaps a refresh token for a new pair
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Override for the secret store file
    #[serde(default)]
    pub token_store: Option<PathBuf>,

    /// How long a stored access token is trusted locally
    #[serde(default = "default_token_days")]
    pub token_valid_days: u64,
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

fn default_token_days() -> u64 {
    30
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: default_refresh_path(),
            token_store: None,
            token_valid_days: default_token_days(),
        }
    }
}

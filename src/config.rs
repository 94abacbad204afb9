//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! polling backoff tables, cache sizing, channel capacities, HTTP defaults,
//! logging format, and default paths. `AppConfig` is the root configuration
//! struct containing all settings.

use const_format::formatcp;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Polling Backoff Tables
// =============================================================================
// Delays in seconds between polls of a descriptor. The index into a table
// advances by one for every poll that brings no new posts and resets to zero
// whenever the post count grows. Archive sources change rarely, so they are
// polled far less frequently.

/// Backoff table for live sources
pub const DEFAULT_LIVE_POLL_DELAYS_SECS: [u64; 14] =
    [15, 20, 30, 45, 60, 90, 120, 180, 240, 300, 450, 600, 750, 1000];

/// Backoff table for archive/mirror sources
pub const DEFAULT_ARCHIVE_POLL_DELAYS_SECS: [u64; 6] = [300, 600, 1200, 1800, 2400, 3600];

// =============================================================================
// Cache Constants
// =============================================================================

/// Maximum number of threads held by the in-memory post cache
pub const DEFAULT_CACHE_MAX_THREADS: usize = 1000;

/// Divisor for the eviction batch (capacity / divisor entries are trimmed)
pub const DEFAULT_CACHE_TRIM_DIVISOR: usize = 4;

// =============================================================================
// Channel Capacities
// =============================================================================

/// Capacity of an engine's command queue
pub const ENGINE_COMMAND_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// HTTP / Mirror Timeouts
// =============================================================================

/// Default request timeout for the HTTP transport
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default upper bound on a single mirror lookup
pub const DEFAULT_MIRROR_TIMEOUT_SECS: u64 = 15;

/// User agent sent with every request unless overridden
pub const DEFAULT_USER_AGENT: &str =
    formatcp!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default directory for persisted posts
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "threadwatch=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Placeholder replaced by the board code in URL templates
pub const BOARD_PLACEHOLDER: &str = "{board}";

/// Placeholder replaced by the thread number in URL templates
pub const THREAD_PLACEHOLDER: &str = "{thread}";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Sites the client knows how to reach
    #[serde(default)]
    pub site: Vec<SiteConfig>,
    /// Third-party mirrors used to recover deleted posts
    #[serde(default)]
    pub mirror: Vec<MirrorConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub mirror_settings: MirrorSettings,
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Whether a site serves live content or is itself an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Live,
    Archive,
}

/// Configuration for a single site
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site name (used as the descriptor's site component)
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    /// Catalog URL template, e.g. `https://a.example/{board}/catalog.json`
    pub catalog_url: String,
    /// Thread URL template, e.g. `https://a.example/{board}/thread/{thread}.json`
    pub thread_url: String,
}

/// Configuration for a third-party mirror
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    /// Thread URL template on the mirror
    pub thread_url: String,
    /// Names of the sites this mirror covers
    #[serde(default)]
    pub sites: Vec<String>,
}

impl MirrorConfig {
    /// Check whether this mirror archives the given site
    pub fn covers(&self, site: &str) -> bool {
        self.sites.iter().any(|s| s == site)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds (default: 30)
    #[serde(default = "HttpConfig::default_timeout")]
    pub timeout_seconds: u64,
    /// User agent override
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Self::default_timeout(),
            user_agent: None,
        }
    }
}

impl HttpConfig {
    fn default_timeout() -> u64 {
        DEFAULT_HTTP_TIMEOUT_SECS
    }

    /// Get the effective user agent
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached threads (default: 1000)
    #[serde(default = "CacheConfig::default_max_threads")]
    pub max_threads: usize,
    /// Eviction trims max_threads / trim_divisor entries (default: 4)
    #[serde(default = "CacheConfig::default_trim_divisor")]
    pub trim_divisor: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_threads: Self::default_max_threads(),
            trim_divisor: Self::default_trim_divisor(),
        }
    }
}

impl CacheConfig {
    fn default_max_threads() -> usize {
        DEFAULT_CACHE_MAX_THREADS
    }

    fn default_trim_divisor() -> usize {
        DEFAULT_CACHE_TRIM_DIVISOR
    }

    /// Number of entries removed per eviction pass (at least one)
    pub fn trim_batch(&self) -> usize {
        (self.max_threads / self.trim_divisor.max(1)).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "PollingConfig::default_live_delays")]
    pub live_delays_seconds: Vec<u64>,
    #[serde(default = "PollingConfig::default_archive_delays")]
    pub archive_delays_seconds: Vec<u64>,
    /// Re-arm the poll timer after every successful thread fetch
    #[serde(default = "PollingConfig::default_auto_poll")]
    pub auto_poll: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            live_delays_seconds: Self::default_live_delays(),
            archive_delays_seconds: Self::default_archive_delays(),
            auto_poll: Self::default_auto_poll(),
        }
    }
}

impl PollingConfig {
    fn default_live_delays() -> Vec<u64> {
        DEFAULT_LIVE_POLL_DELAYS_SECS.to_vec()
    }

    fn default_archive_delays() -> Vec<u64> {
        DEFAULT_ARCHIVE_POLL_DELAYS_SECS.to_vec()
    }

    fn default_auto_poll() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSettings {
    /// Query mirrors for deleted posts (default: true)
    #[serde(default = "MirrorSettings::default_enabled")]
    pub enabled: bool,
    /// Upper bound on a single mirror lookup in seconds (default: 15)
    #[serde(default = "MirrorSettings::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl MirrorSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_timeout() -> u64 {
        DEFAULT_MIRROR_TIMEOUT_SECS
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
        }
    }
}

impl StoreConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from(DEFAULT_DATA_DIR)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.site.is_empty() {
            return Err(ConfigError::Validation(
                "No sites configured. Add at least one [[site]] section".to_string(),
            ));
        }

        for site in &self.site {
            if !site.thread_url.contains(THREAD_PLACEHOLDER) {
                return Err(ConfigError::Validation(format!(
                    "Site '{}': thread_url must contain {}",
                    site.name, THREAD_PLACEHOLDER
                )));
            }
        }

        for mirror in &self.mirror {
            if !mirror.thread_url.contains(THREAD_PLACEHOLDER) {
                return Err(ConfigError::Validation(format!(
                    "Mirror '{}': thread_url must contain {}",
                    mirror.name, THREAD_PLACEHOLDER
                )));
            }
        }

        if self.polling.live_delays_seconds.is_empty()
            || self.polling.archive_delays_seconds.is_empty()
        {
            return Err(ConfigError::Validation(
                "Polling delay tables must not be empty".to_string(),
            ));
        }

        if self.cache.max_threads == 0 {
            return Err(ConfigError::Validation(
                "cache.max_threads must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

//! Configuration file parser for ~/.config/threadline/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::util::validate_relay_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay URLs (ws:// or wss://) for a network `RelayClient`.
    ///
    /// Validated on load and handed to whoever embeds the engine with a
    /// real relay pool. The bundled CLI runs against the offline relay and
    /// only reports that these are configured.
    pub relays: Vec<String>,

    /// Give every feed its own seen set instead of sharing one app-wide.
    pub per_feed_dedup: bool,

    /// Start feeds with replies hidden.
    pub hide_replies: bool,

    /// New records inserted while the reader is at the top do not count as unread.
    pub auto_scroll: bool,

    /// Case-insensitive words that hide a record when found in its content.
    pub muted_words: Vec<String>,

    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            per_feed_dedup: false,
            hide_replies: false,
            auto_scroll: false,
            muted_words: Vec::new(),
            tuning: Tuning::default(),
        }
    }
}

/// Timing and sizing knobs of the feed engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub max_visible: usize,
    pub min_keep_below_new: usize,
    pub min_drop_batch: usize,
    /// Replies older than this never wait for a missing parent.
    pub recency_horizon_secs: u64,
    pub queue_capacity: usize,
    pub queue_ttl_secs: u64,
    pub queue_sweep_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Window over which missing-parent requests are coalesced.
    pub fetch_debounce_ms: u64,
    pub catchup_interval_secs: u64,
    /// Delay between going live and the one-off catch-up request.
    pub catchup_delay_secs: u64,
    /// Overlap subtracted from the catch-up `since`.
    pub catchup_lookback_secs: u64,
    /// Minimum spacing of local fetches triggered by imports.
    pub merge_throttle_ms: u64,
    pub scroll_throttle_ms: u64,
    pub publish_throttle_ms: u64,
    pub near_bottom_distance: usize,
    pub page_size: usize,
    /// The store must hold more than this many records to skip the network on start.
    pub bootstrap_min_records: usize,
    pub bootstrap_limit: usize,
    pub bootstrap_timeout_secs: u64,
    /// Retry a local fetch this long after an empty bootstrap.
    pub empty_retry_secs: u64,
    pub save_state_debounce_ms: u64,
    pub max_thread_depth: usize,
    pub cache_capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_visible: 20,
            min_keep_below_new: 10,
            min_drop_batch: 5,
            recency_horizon_secs: 86_400,
            queue_capacity: 2000,
            queue_ttl_secs: 30,
            queue_sweep_secs: 15,
            fetch_timeout_secs: 6,
            fetch_debounce_ms: 1000,
            catchup_interval_secs: 9,
            catchup_delay_secs: 8,
            catchup_lookback_secs: 300,
            merge_throttle_ms: 2500,
            scroll_throttle_ms: 50,
            publish_throttle_ms: 50,
            near_bottom_distance: 15,
            page_size: 25,
            bootstrap_min_records: 35,
            bootstrap_limit: 200,
            bootstrap_timeout_secs: 12,
            empty_retry_secs: 5,
            save_state_debounce_ms: 1000,
            max_thread_depth: 35,
            cache_capacity: 1000,
        }
    }
}

impl Tuning {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn fetch_debounce(&self) -> Duration {
        Duration::from_millis(self.fetch_debounce_ms)
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }

    pub fn queue_sweep(&self) -> Duration {
        Duration::from_secs(self.queue_sweep_secs.max(1))
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.catchup_interval_secs.max(1))
    }

    pub fn catchup_delay(&self) -> Duration {
        Duration::from_secs(self.catchup_delay_secs)
    }

    pub fn merge_throttle(&self) -> Duration {
        Duration::from_millis(self.merge_throttle_ms)
    }

    pub fn scroll_throttle(&self) -> Duration {
        Duration::from_millis(self.scroll_throttle_ms)
    }

    pub fn publish_throttle(&self) -> Duration {
        Duration::from_millis(self.publish_throttle_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn empty_retry(&self) -> Duration {
        Duration::from_secs(self.empty_retry_secs)
    }

    pub fn save_state_debounce(&self) -> Duration {
        Duration::from_millis(self.save_state_debounce_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_visible == 0 {
            return Err(ConfigError::Invalid("tuning.max_visible must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("tuning.page_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("tuning.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "relays",
        "per_feed_dedup",
        "hide_replies",
        "auto_scroll",
        "muted_words",
        "tuning",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Invalid relay URL or zero-sized tuning → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            relays = config.relays.len(),
            per_feed_dedup = config.per_feed_dedup,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for relay in &self.relays {
            validate_relay_url(relay)
                .map_err(|e| ConfigError::Invalid(format!("relay '{}': {}", relay, e)))?;
        }
        self.tuning.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================

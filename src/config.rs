//! Configuration file parser for `feedwarden.toml`.
//!
//! The config file is optional and a missing file yields `Config::default()`.
//! Unknown top-level keys are ignored by serde, but we log a warning for each
//! since they are usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{SchedulerOptions, DEFAULT_MAX_BODY_BYTES, DEFAULT_REQUEST_TIMEOUT};
use crate::model::DEFAULT_TTL_MINUTES;

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

    /// A value parsed but is out of range.
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: &'static str },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Created if missing.
    pub database_path: String,

    /// Cadence for sources that neither the config nor the feed gives one.
    pub default_cadence_minutes: u64,

    /// Bound on a whole fetch, headers and body.
    pub request_timeout_secs: u64,

    pub max_body_bytes: usize,

    pub user_agent: String,

    /// Capacity of the document stream.
    pub document_buffer: usize,

    /// Capacity of the error stream.
    pub error_buffer: usize,

    pub sources: Vec<SourceConfig>,
}

/// One `[[sources]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    /// Overrides `default_cadence_minutes` for this source.
    #[serde(default)]
    pub cadence_minutes: Option<u64>,
}

impl SourceConfig {
    pub fn cadence(&self) -> Option<Duration> {
        self.cadence_minutes.map(|m| Duration::from_secs(m.saturating_mul(60)))
    }
}

impl Default for Config {
    fn default() -> Self {
        let options = SchedulerOptions::default();
        Self {
            database_path: "feedwarden.db".to_string(),
            default_cadence_minutes: u64::from(DEFAULT_TTL_MINUTES),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            user_agent: format!("feedwarden/{}", env!("CARGO_PKG_VERSION")),
            document_buffer: options.document_buffer,
            error_buffer: options.error_buffer,
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "database_path",
        "default_cadence_minutes",
        "request_timeout_secs",
        "max_body_bytes",
        "user_agent",
        "document_buffer",
        "error_buffer",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range value → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a huge file
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
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path,
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("default_cadence_minutes", self.default_cadence_minutes == 0),
            ("request_timeout_secs", self.request_timeout_secs == 0),
            ("max_body_bytes", self.max_body_bytes == 0),
            ("document_buffer", self.document_buffer == 0),
            ("error_buffer", self.error_buffer == 0),
        ];
        for (key, is_zero) in zero {
            if is_zero {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be greater than zero",
                });
            }
        }

        for source in &self.sources {
            if source.cadence_minutes == Some(0) {
                return Err(ConfigError::Invalid {
                    key: format!("sources[{}].cadence_minutes", source.url),
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            default_cadence: Duration::from_secs(self.default_cadence_minutes.saturating_mul(60)),
            document_buffer: self.document_buffer,
            error_buffer: self.error_buffer,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================

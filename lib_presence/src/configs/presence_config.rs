//! # Presence Configuration
//!
//! Timing knobs of the sync core, layered with `more-config`:
//!
//! 1. Built-in defaults (the observed production values).
//! 2. An optional JSON file. Keys may be camelCase (`stalenessWindowMs`) or
//!    snake_case (`staleness_window_ms`).
//! 3. `PRESENCE_*` environment variables, e.g. `PRESENCE_STALENESS_WINDOW_MS`.
//!
//! Later providers override earlier ones key by key. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{ext::*, *};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::merger::MergerOptions;
use crate::core::reporter::ReporterOptions;

/// Prefix of the environment variables read by `PresenceConfig::load`.
pub const ENV_PREFIX: &str = "PRESENCE_";

/// Errors while assembling a `PresenceConfig`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A provider could not be loaded (malformed JSON file, ...).
    #[error("Configuration source error: {0}")]
    Source(String),

    /// A key held something that is not a millisecond count.
    #[error("Configuration key {key} is not a valid number: {value}")]
    InvalidValue {
        /// Normalized key name.
        key: String,
        /// Offending value.
        value: String,
    },

    /// The merged values are inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Resolved timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceConfig {
    /// Rider map staleness window.
    pub staleness_window_ms: u64,
    /// Typing indicator staleness window.
    pub typing_window_ms: u64,
    /// Minimum gap between two location publishes.
    pub location_min_interval_ms: u64,
    /// Minimum gap between two typing publishes.
    pub typing_min_interval_ms: u64,
    /// Fallback location poll period.
    pub poll_interval_ms: u64,
    /// First reconnect delay.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_delay_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 10_000,
            typing_window_ms: 5_000,
            location_min_interval_ms: 1_000,
            typing_min_interval_ms: 1_000,
            poll_interval_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

/// `TYPING_WINDOW_MS`, `typingWindowMs` and `typing_window_ms` all become
/// `typingwindowms`.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl PresenceConfig {
    /// Defaults, then `file` (if it exists), then `PRESENCE_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(file, ENV_PREFIX)
    }

    /// `load` reading environment variables that start with `prefix`.
    pub fn load_with_prefix(file: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = DefaultConfigurationBuilder::new();
        if let Some(path) = file {
            let file_name: String = path.to_string_lossy().to_string();
            builder.add_json_file(&file_name.is().optional());
        }
        builder.add_env_vars_with_prefix(prefix);

        let config_data: Box<dyn ConfigurationRoot> = builder
            .build()
            .map_err(|e| ConfigError::Source(format!("{:?}", e)))?;

        let mut options: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in config_data.iter(None) {
            options.insert(normalize_key(&key.to_string()), value.to_string());
        }

        let config = Self::from_options(&options)?;
        config.validate()?;
        tracing::debug!(?config, keys = options.len(), "presence configuration resolved");
        Ok(config)
    }

    /// Defaults overridden by every recognized key of `options`. Keys must
    /// already be normalized (lowercase, no underscores).
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let read = |key: &str, current: u64| -> Result<u64, ConfigError> {
            match options.get(key) {
                None => Ok(current),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.clone(),
                    }),
            }
        };

        let defaults = Self::default();
        Ok(Self {
            staleness_window_ms: read("stalenesswindowms", defaults.staleness_window_ms)?,
            typing_window_ms: read("typingwindowms", defaults.typing_window_ms)?,
            location_min_interval_ms: read("locationminintervalms", defaults.location_min_interval_ms)?,
            typing_min_interval_ms: read("typingminintervalms", defaults.typing_min_interval_ms)?,
            poll_interval_ms: read("pollintervalms", defaults.poll_interval_ms)?,
            reconnect_base_delay_ms: read("reconnectbasedelayms", defaults.reconnect_base_delay_ms)?,
            reconnect_max_delay_ms: read("reconnectmaxdelayms", defaults.reconnect_max_delay_ms)?,
        })
    }

    /// Rejects zero windows and an inverted reconnect range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("stalenessWindowMs", self.staleness_window_ms),
            ("typingWindowMs", self.typing_window_ms),
            ("pollIntervalMs", self.poll_interval_ms),
            ("reconnectBaseDelayMs", self.reconnect_base_delay_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnectBaseDelayMs ({}) exceeds reconnectMaxDelayMs ({})",
                self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        Ok(())
    }

    /// Rider map window as signed millis, as taken by `is_live`.
    pub fn staleness_window_millis(&self) -> i64 {
        i64::try_from(self.staleness_window_ms).unwrap_or(i64::MAX)
    }

    /// Typing window as signed millis.
    pub fn typing_window_millis(&self) -> i64 {
        i64::try_from(self.typing_window_ms).unwrap_or(i64::MAX)
    }

    /// Reconnect pacing for mergers.
    pub fn merger_options(&self) -> MergerOptions {
        MergerOptions {
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    /// Pacing of the location reporter.
    pub fn location_reporter_options(&self) -> ReporterOptions {
        ReporterOptions {
            min_interval: Duration::from_millis(self.location_min_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Pacing of the typing reporter. It has no sensor, so the poll period
    /// is never used.
    pub fn typing_reporter_options(&self) -> ReporterOptions {
        ReporterOptions {
            min_interval: Duration::from_millis(self.typing_min_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

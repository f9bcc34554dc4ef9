//! Typed hub configuration
//!
//! ```yaml
//! logger:
//!   default: info
//!   logs:
//!     ha_update_coordinator: debug
//!
//! coordinator:
//!   scan_interval: 30
//!   request_refresh_cooldown: 10
//!   fetch_timeout: 20
//!
//! entries:
//!   - domain: demo
//!     title: Roof station
//!     unique_id: roof
//!     data:
//!       host: 10.0.0.2
//!       token: !secret station_token
//!     options:
//!       scan_interval: 60
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{load_yaml, YamlLoader};

/// Log verbosity, using the level names of the `logger:` section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "critical", alias = "fatal")]
    Error,
    #[serde(alias = "warn")]
    Warning,
    #[default]
    Info,
    Debug,
    #[serde(alias = "notset")]
    Trace,
}

impl LogLevel {
    /// Directive level understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    #[serde(default)]
    pub default: LogLevel,

    /// Per-target overrides, e.g. `ha_config_entries: debug`
    #[serde(default)]
    pub logs: BTreeMap<String, LogLevel>,
}

impl LoggerConfig {
    /// Filter string such as `info,ha_update_coordinator=debug`
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.default.as_directive().to_string())
            .chain(
                self.logs
                    .iter()
                    .map(|(target, level)| format!("{}={}", target.replace('.', "::"), level.as_directive())),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Coordinator settings used when an integration does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorDefaults {
    /// Seconds between polls
    #[serde(default = "default_scan_interval")]
    pub scan_interval: f64,

    /// Seconds that `request_refresh` calls are collapsed for
    #[serde(default = "default_request_refresh_cooldown")]
    pub request_refresh_cooldown: f64,

    /// Seconds before a fetch is abandoned; unset means no limit
    #[serde(default)]
    pub fetch_timeout: Option<f64>,

    /// Cap on the backoff exponent after consecutive failures
    #[serde(default = "default_backoff_max_exponent")]
    pub backoff_max_exponent: u32,

    /// Fraction of the delay added or removed at random
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
}

fn default_scan_interval() -> f64 {
    30.0
}

fn default_request_refresh_cooldown() -> f64 {
    10.0
}

fn default_backoff_max_exponent() -> u32 {
    4
}

fn default_backoff_jitter() -> f64 {
    0.2
}

impl Default for CoordinatorDefaults {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            request_refresh_cooldown: default_request_refresh_cooldown(),
            fetch_timeout: None,
            backoff_max_exponent: default_backoff_max_exponent(),
            backoff_jitter: default_backoff_jitter(),
        }
    }
}

impl CoordinatorDefaults {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval)
    }

    pub fn request_refresh_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.request_refresh_cooldown)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout.map(Duration::from_secs_f64)
    }

    fn validate(&self) -> ConfigResult<()> {
        positive_seconds("coordinator.scan_interval", self.scan_interval)?;
        if self.request_refresh_cooldown != 0.0 {
            positive_seconds("coordinator.request_refresh_cooldown", self.request_refresh_cooldown)?;
        }
        if let Some(timeout) = self.fetch_timeout {
            positive_seconds("coordinator.fetch_timeout", timeout)?;
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::invalid(
                "coordinator.backoff_jitter",
                "must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

fn positive_seconds(key: &str, seconds: f64) -> ConfigResult<()> {
    // Duration::from_secs_f64 panics on anything else
    if seconds.is_finite() && seconds > 0.0 && seconds < u64::MAX as f64 {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, "must be a positive number of seconds"))
    }
}

/// A config entry declared in the YAML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    pub domain: String,

    pub title: String,

    #[serde(default)]
    pub unique_id: Option<String>,

    /// Integration-specific settings, validated by the integration at setup
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub pref_disable_polling: bool,
}

fn default_version() -> u32 {
    1
}

/// Everything the hub reads from its configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub coordinator: CoordinatorDefaults,

    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

impl HubConfig {
    /// Load, resolve tags, deserialize and validate
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let document = load_yaml(path)?;
        let config = Self::from_value(document, path)?;
        info!(
            "Loaded configuration from {:?} ({} entries)",
            path,
            config.entries.len()
        );
        Ok(config)
    }

    /// Parse a document held in memory; `!secret` resolves against `config_dir`
    pub fn from_yaml_str(content: &str, config_dir: &Path) -> ConfigResult<Self> {
        let origin = config_dir.join("<memory>");
        let document = YamlLoader::new(config_dir)?.load_str(content, &origin)?;
        Self::from_value(document, &origin)
    }

    fn from_value(document: serde_yaml::Value, origin: &Path) -> ConfigResult<Self> {
        // An empty file is a valid, empty configuration
        let config = if document.is_null() {
            Self::default()
        } else {
            serde_yaml::from_value(document).map_err(|source| ConfigError::Schema {
                path: origin.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.coordinator.validate()?;

        let mut unique_ids = HashSet::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let key = format!("entries[{index}]");

            if entry.domain.is_empty()
                || !entry
                    .domain
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(ConfigError::invalid(
                    format!("{key}.domain"),
                    format!("'{}' is not a valid domain", entry.domain),
                ));
            }
            if entry.title.trim().is_empty() {
                return Err(ConfigError::invalid(format!("{key}.title"), "must not be empty"));
            }
            if entry.version == 0 {
                return Err(ConfigError::invalid(format!("{key}.version"), "must be at least 1"));
            }
            if let Some(unique_id) = &entry.unique_id {
                if !unique_ids.insert((entry.domain.as_str(), unique_id.as_str())) {
                    return Err(ConfigError::invalid(
                        format!("{key}.unique_id"),
                        format!("'{unique_id}' is already used by another {} entry", entry.domain),
                    ));
                }
            }
        }
        Ok(())
    }
}

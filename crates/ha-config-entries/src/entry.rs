//! Config Entry types
//!
//! A ConfigEntry represents a single instance of an integration's configuration.

use chrono::{DateTime, Utc};
use ha_core::SetupError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Currently being configured (non-recoverable)
    SetupInProgress,
    /// Successfully set up (recoverable)
    Loaded,
    /// Setup failed (recoverable)
    SetupError,
    /// Waiting to retry setup (recoverable)
    SetupRetry,
    /// Version migration failed (not recoverable)
    MigrationError,
    /// Currently unloading (non-recoverable)
    UnloadInProgress,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    /// Check if the entry can be unloaded/reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }
}

/// How the entry was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured by the user
    #[default]
    User,
    /// Imported from the YAML config file
    Import,
    /// Found by discovery
    Discovery,
    /// Re-authentication flow
    Reauth,
    /// User reconfiguring an existing entry
    Reconfigure,
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
    Integration,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g., "demo", "met")
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Validated configuration produced by the config flow
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// User-configurable options
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    /// Schema version of `data`
    #[serde(default = "default_version")]
    pub version: u32,

    /// Optional unique identifier for duplicate prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Number of setup retry attempts (not persisted)
    #[serde(skip, default)]
    pub tries: u32,

    /// A reauthentication flow is waiting on the user (not persisted)
    #[serde(skip, default)]
    pub reauth_pending: bool,

    /// Disable background polling
    #[serde(default)]
    pub pref_disable_polling: bool,

    /// What disabled this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            reauth_pending: false,
            pref_disable_polling: false,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_polling_disabled(mut self, disabled: bool) -> Self {
        self.pref_disable_polling = disabled;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Deserialize `data` into the integration's typed configuration
    ///
    /// Fails with [`SetupError::Failed`]: malformed data is not retried.
    pub fn parse_data<C: DeserializeOwned>(&self) -> Result<C, SetupError> {
        parse_map(&self.data).map_err(|err| {
            SetupError::failed(format!("Invalid configuration for {}: {err}", self.domain))
        })
    }

    /// Deserialize `options`, falling back to the type's defaults for missing keys
    pub fn parse_options<C: DeserializeOwned>(&self) -> Result<C, SetupError> {
        parse_map(&self.options).map_err(|err| {
            SetupError::failed(format!("Invalid options for {}: {err}", self.domain))
        })
    }

    /// Attempt to transition to a new state with validation.
    ///
    /// On success, updates the state and reason fields.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;

        self.state = new_state;
        self.reason = reason;

        // Tries only accumulate across a chain of retries
        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }

        Ok(())
    }

    /// Increment the retry counter and return the new count
    pub fn increment_tries(&mut self) -> u32 {
        self.tries += 1;
        self.tries
    }
}

fn parse_map<C: DeserializeOwned>(
    map: &HashMap<String, serde_json::Value>,
) -> Result<C, serde_json::Error> {
    let object: serde_json::Map<String, serde_json::Value> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    serde_json::from_value(serde_json::Value::Object(object))
}

/// Changes to apply to an entry; `None` fields are left alone
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub options: Option<HashMap<String, serde_json::Value>>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
    pub pref_disable_polling: Option<bool>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn pref_disable_polling(mut self, disabled: bool) -> Self {
        self.pref_disable_polling = Some(disabled);
        self
    }

    /// Apply to `entry`; returns whether anything changed
    pub(crate) fn apply(self, entry: &mut ConfigEntry) -> bool {
        let mut changed = false;

        if let Some(title) = self.title {
            changed |= replace_if_different(&mut entry.title, title);
        }
        if let Some(data) = self.data {
            changed |= replace_if_different(&mut entry.data, data);
        }
        if let Some(options) = self.options {
            changed |= replace_if_different(&mut entry.options, options);
        }
        if let Some(unique_id) = self.unique_id {
            changed |= replace_if_different(&mut entry.unique_id, unique_id);
        }
        if let Some(version) = self.version {
            changed |= replace_if_different(&mut entry.version, version);
        }
        if let Some(pref) = self.pref_disable_polling {
            changed |= replace_if_different(&mut entry.pref_disable_polling, pref);
        }

        if changed {
            entry.modified_at = Utc::now();
        }
        changed
    }
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

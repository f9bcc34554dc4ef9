//! Config Entries
//!
//! This crate provides the configuration entry system. A config entry is
//! one configured instance of an integration; the manager sets it up, retries
//! setups that were not ready, unloads it and reloads it when asked.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`Integration`] - What a domain implements to be set up from entries
//! - [`EntryContext`] - Per-setup owner of runtime data, entities and unload hooks

pub mod context;
pub mod entry;
pub mod integration;
mod lock;
pub mod manager;
pub mod state_machine;

pub use context::{EntryContext, RuntimeData, UpdateListener};
pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};
pub use integration::{EntityPlatform, Integration};
pub use manager::{ConfigEntries, ConfigEntriesError, ConfigEntriesResult, ConfigEntryEvent};
pub use state_machine::{setup_retry_delay, InvalidTransition};

//! YAML configuration for the hub
//!
//! The configuration file is read once at startup: tags are resolved
//! (`!secret`, `!env_var`, `!include`), the document is deserialized into
//! [`HubConfig`] and validated. Integration-specific entry data stays a JSON
//! map until the integration parses it into its own type at setup.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::HubConfig;
//!
//! let config = HubConfig::load(Path::new("/config/hub.yaml"))?;
//! let filter = config.logger.filter_directives();
//! ```

mod error;
mod hub;
mod loader;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use hub::{CoordinatorDefaults, EntryConfig, HubConfig, LogLevel, LoggerConfig};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::{Secrets, SECRETS_FILE};

pub use serde_yaml::Value;

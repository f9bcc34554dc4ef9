//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("secret '{key}' not found in {path}")]
    SecretNotFound { key: String, path: PathBuf },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// A tag was applied to something other than a scalar string
    #[error("invalid argument for {tag}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("circular include detected: {path}")]
    CircularInclude { path: PathBuf },

    /// The document does not match the expected structure
    #[error("invalid configuration in {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

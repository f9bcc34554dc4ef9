//! Error taxonomy for update sources and config entry setup
//!
//! Update sources report failures as [`UpdateError`]. The coordinator only
//! distinguishes transient failures (back off and keep polling) from
//! authentication failures (stop polling, ask the user for credentials).
//! The config entry layer sees [`SetupError`], which is what a failed first
//! refresh turns into.

use std::time::Duration;
use thiserror::Error;

/// Result type for a single fetch from an update source
pub type UpdateResult<T> = Result<T, UpdateError>;

/// A failed fetch from an update source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// Transient failure: upstream unreachable, malformed response, timeout
    #[error("{message}")]
    UpdateFailed {
        message: String,
        /// Overrides the backoff delay for the next attempt
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected; requires user action
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Fatal configuration problem that is not an auth failure
    #[error("config entry error: {0}")]
    EntryError(String),
}

impl UpdateError {
    /// Transient failure with a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::UpdateFailed {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient failure where the upstream told us when to come back
    pub fn failed_with_retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::UpdateFailed {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Wrap a transport-specific error as a transient failure
    pub fn from_source<E: std::error::Error>(context: &str, err: E) -> Self {
        Self::failed(format!("{context}: {err}"))
    }

    /// Authentication failure
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    /// Fatal non-auth failure
    pub fn entry_error(message: impl Into<String>) -> Self {
        Self::EntryError(message.into())
    }

    /// True for failures the coordinator retries with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpdateFailed { .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }

    /// Upstream-provided delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpdateFailed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Why a config entry could not be set up
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    /// The device or service is not reachable yet; setup is retried later
    #[error("not ready: {0}")]
    NotReady(String),

    /// Credentials were rejected; a reauthentication flow is started
    #[error("could not authenticate: {0}")]
    AuthFailed(String),

    /// Setup failed and will not be retried automatically
    #[error("{0}")]
    Failed(String),
}

impl SetupError {
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<UpdateError> for SetupError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::UpdateFailed { message, .. } => SetupError::NotReady(message),
            UpdateError::AuthFailed(message) => SetupError::AuthFailed(message),
            UpdateError::EntryError(message) => SetupError::Failed(message),
        }
    }
}

//! Error types for the PFC watchdog.
//!
//! None of these are fatal to the orchestration loop: a failure is scoped
//! to the port or session it names and the remaining sessions keep running.

use std::time::Duration;
use thiserror::Error;

use crate::state::SessionState;
use crate::types::SessionKey;

/// Result type alias for watchdog operations.
pub type Result<T> = std::result::Result<T, PfcWdError>;

/// Failure reported by a counter or ACL backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached (syncd down, redis unavailable).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The call did not complete in time.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur in watchdog operations.
#[derive(Debug, Clone, Error)]
pub enum PfcWdError {
    /// Configuration referenced a port the watchdog does not know.
    #[error("Port '{port}' not found")]
    InvalidPort {
        /// The port alias.
        port: String,
    },

    /// Configuration value failed validation.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A counter or ACL backend call failed.
    #[error("Backend operation {operation} failed: {source}")]
    BackendUnavailable {
        /// The operation that failed (e.g. "register_counters").
        operation: String,
        /// The backend failure.
        #[source]
        source: BackendError,
    },

    /// A mitigation operation failed after every retry.
    #[error("Mitigation for {key} gave up after {attempts} attempts (state {state})")]
    RetryExhausted {
        /// The affected session.
        key: SessionKey,
        /// Session state when the failure was declared.
        state: SessionState,
        /// Number of attempts made.
        attempts: u32,
        /// The last backend failure.
        #[source]
        source: BackendError,
    },
}

impl PfcWdError {
    /// Creates an invalid port error.
    pub fn invalid_port(port: impl Into<String>) -> Self {
        Self::InvalidPort { port: port.into() }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a backend error for the named operation.
    pub fn backend(operation: impl Into<String>, source: BackendError) -> Self {
        Self::BackendUnavailable {
            operation: operation.into(),
            source,
        }
    }
}

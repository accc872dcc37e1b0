//! Error taxonomy for the Result Archive Store.
//!
//! Every component returns [`RasError`]. Transport and codec errors are
//! wrapped into one of these variants before they leave the component that
//! produced them, so callers only ever match on this enum.

use thiserror::Error;

/// Convenience alias used across the store.
pub type Result<T> = std::result::Result<T, RasError>;

/// Errors raised by the archive store and its collaborators.
#[derive(Debug, Error)]
pub enum RasError {
    /// The remote server failed identity or version checks at startup.
    #[error("server validation failed: {0}")]
    Validation(String),

    /// A revision precondition no longer matched the server's revision.
    ///
    /// This is the only variant the update processor retries.
    #[error("revision conflict updating {collection}/{id}")]
    Conflict { collection: String, id: String },

    /// Any other unexpected HTTP status or malformed payload.
    #[error("store error: {0}")]
    Store(String),

    /// A document, attachment or artifact path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict retries exceeded their ceiling.
    #[error("update still conflicting after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The run was stopped after a fatal write failure; no further writes
    /// are accepted.
    #[error("run {run_name} has been terminated: {reason}")]
    RunTerminated { run_name: String, reason: String },

    /// An artifact path string could not be parsed.
    #[error("invalid artifact path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RasError {
    /// Shorthand for building a [`RasError::Store`].
    pub fn store(msg: impl Into<String>) -> Self {
        RasError::Store(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RasError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RasError::NotFound(_))
    }

    /// Errors after which the owning run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RasError::RetryExhausted { .. } | RasError::RunTerminated { .. }
        )
    }
}

//! Error types for fleet orchestration

use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the instance and database managers
#[derive(Debug, Error)]
pub enum Error {
    /// The referenced instance or isolated database is not tracked
    #[error("not found: {0}")]
    NotFound(String),

    /// An instance, database, or port is already claimed
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Start requested for an instance that is already running
    #[error("instance {0} is already running")]
    AlreadyRunning(String),

    /// Stop requested for an instance that is not running
    #[error("instance {0} is not running")]
    NotRunning(String),

    /// Storage creation or schema bootstrap failed
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The process supervisor could not spawn, stop, or restart a process
    #[error("process control failed: {0}")]
    Process(String),

    /// Registry or config file I/O failed
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// The operation is not available on the configured backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Invariant violation inside the manager itself
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn provisioning(err: impl std::fmt::Display) -> Self {
        Self::Provisioning(err.to_string())
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} lock poisoned"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Provisioning(err.to_string())
    }
}

impl From<postgres::Error> for Error {
    fn from(err: postgres::Error) -> Self {
        Self::Provisioning(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

//! Error types for supervisor operations

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    /// The unit could not determine its own identity or configuration
    /// at startup and entered the corrupted state.
    #[error("Unit corrupted: {0}")]
    Corrupted(String),

    #[error("Unit startup timeout")]
    StartupTimeout,

    #[error("Unit shutdown timeout")]
    ShutdownTimeout,

    #[error("Unit {0} is not available")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

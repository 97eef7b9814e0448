//! Core error types and utilities

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the harness core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// The target executable is missing or the spawn call failed
    #[error("Launch error: {0}")]
    LaunchError(String),

    /// The process group could not be signalled
    #[error("Signal delivery error: {0}")]
    SignalDeliveryError(String),

    /// Waiting for the child failed or exceeded its bound
    #[error("Process wait error: {0}")]
    ProcessWait(String),

    /// The log file exists but could not be read
    #[error("Failed to read log file {path:?}: {source}")]
    LogReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be removed during teardown
    #[error("Failed to remove log file {path:?}: {source}")]
    CleanupError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "TP001",
            CoreError::ValidationError(_) => "TP002",
            CoreError::InitializationError(_) => "TP003",
            CoreError::LaunchError(_) => "TP004",
            CoreError::SignalDeliveryError(_) => "TP005",
            CoreError::ProcessWait(_) => "TP006",
            CoreError::LogReadError { .. } => "TP007",
            CoreError::CleanupError { .. } => "TP008",
        }
    }

    /// Whether a run may record this error and carry on.
    ///
    /// Unreadable logs, undeliverable signals and failed log removal never
    /// abort a run.
    pub fn is_tolerated(&self) -> bool {
        matches!(
            self,
            CoreError::LogReadError { .. }
                | CoreError::SignalDeliveryError(_)
                | CoreError::CleanupError { .. }
        )
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

//! CLI error types

use forkline_core::RunError;
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}: not found in PATH")]
    NotInPath(String),
}

impl CliError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Run(e) => e.code(),
            CliError::InvalidArgument(_) => "CLI002",
            CliError::ConfigError(_) => "CLI003",
            CliError::NotInPath(_) => "CLI004",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Run(e) => e.exit_code(),
            CliError::NotInPath(_) => 1,
            CliError::InvalidArgument(_) => 129,
            CliError::ConfigError(_) => 128,
        }
    }

    /// Whether the core already reported this failure
    pub fn already_reported(&self) -> bool {
        match self {
            CliError::Run(e) => !matches!(
                e,
                RunError::InvalidCommand(_) | RunError::Configuration(_)
            ),
            _ => false,
        }
    }
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;

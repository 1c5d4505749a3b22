//! Run error types and utilities
//!
//! The variants follow the life of a launch: setup failures (no process
//! exists), launch failures (fork succeeded, exec did not), reap failures,
//! and the threaded async backend. A child that ran and exited non-zero is
//! not an error; see [`crate::ExitStatus`].

use nix::errno::Errno;
use std::fmt;
use thiserror::Error;

/// The standard stream a pipe was being created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    /// fd 0
    Stdin,
    /// fd 1
    Stdout,
    /// fd 2
    Stderr,
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamName::Stdin => f.write_str("standard input"),
            StreamName::Stdout => f.write_str("standard output"),
            StreamName::Stderr => f.write_str("standard error"),
        }
    }
}

/// Run-specific error types
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("cannot create {stream} pipe for {program}: {source}")]
    Pipe {
        stream: StreamName,
        program: String,
        #[source]
        source: Errno,
    },

    #[error("cannot fork() for {program}: {source}")]
    Fork {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("cannot run {program}: {}", Errno::ENOENT.desc())]
    NotFound { program: String },

    #[error("cannot exec '{program}': {source}")]
    Exec {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("child setup for '{program}' failed: {source}")]
    ChildSetup {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("waitpid for {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("waitpid is confused ({program})")]
    WaitConfused { program: String },

    #[error("cannot create thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("joining async task failed")]
    Join,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RunError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            RunError::InvalidCommand(_) => "RUN001",
            RunError::Pipe { .. } => "RUN002",
            RunError::Fork { .. } => "RUN003",
            RunError::NotFound { .. } => "RUN004",
            RunError::Exec { .. } => "RUN005",
            RunError::ChildSetup { .. } => "RUN006",
            RunError::Wait { .. } => "RUN007",
            RunError::WaitConfused { .. } => "RUN008",
            RunError::Thread(_) => "RUN009",
            RunError::Join => "RUN010",
            RunError::Configuration(_) => "RUN011",
        }
    }

    /// The OS error behind this failure, if there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            RunError::Pipe { source, .. }
            | RunError::Fork { source, .. }
            | RunError::Exec { source, .. }
            | RunError::ChildSetup { source, .. }
            | RunError::Wait { source, .. } => Some(*source),
            RunError::NotFound { .. } => Some(Errno::ENOENT),
            _ => None,
        }
    }

    /// Whether the command could not be found
    pub fn is_not_found(&self) -> bool {
        matches!(self, RunError::NotFound { .. })
    }

    /// Exit code a front end should use when this error ends the process.
    ///
    /// Only the process boundary turns "not found" back into the shell's
    /// 127; everything else that prevented a result is 128, the fatal-error
    /// status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::NotFound { .. } => 127,
            _ => 128,
        }
    }
}

/// Run-specific result type
pub type Result<T> = std::result::Result<T, RunError>;

//! How a child ended

use nix::sys::signal::Signal;
use std::fmt;

/// Result of a child that ran to completion.
///
/// A non-zero exit or a signal is data, not an error; callers decide what
/// it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited on its own with this code (0..=255, never 127)
    Exited(i32),
    /// Killed by this signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Shell-style exit code: the exit code, or `128 + signal number`
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + *signal as i32,
        }
    }

    /// Whether the child exited with 0
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// The signal that killed the child, if any
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Signaled(signal) => Some(*signal),
            ExitStatus::Exited(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", *signal as i32),
        }
    }
}

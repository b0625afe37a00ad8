//! Errors raised by the Multipass client.

use thiserror::Error;

use crate::process::ProcessError;

/// Errors raised while driving the `multipass` CLI.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MultipassError {
    /// Raised when neither `multipass.exe` nor `multipass` is on `PATH`.
    #[error("multipass binary is not found on PATH (set JETSKI_MULTIPASS_BIN to override)")]
    BinaryNotFound,
    /// Raised when a Multipass command exits unsuccessfully.
    #[error("'{command}' exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Rendered command line.
        command: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command, if any.
        stderr: String,
    },
    /// Raised when `multipass info` does not answer within its bound.
    #[error(
        "timed out waiting for 'multipass info {name}' to respond after {timeout_ms}ms; perhaps the multipassd daemon hung?"
    )]
    Timeout {
        /// Instance being queried.
        name: String,
        /// Bound that was exceeded.
        timeout_ms: u128,
    },
    /// Raised when `multipass info` output is not the expected JSON.
    #[error("unexpected output from 'multipass info {name}': {message}. Got: {payload}")]
    Parse {
        /// Instance being queried.
        name: String,
        /// Parser or schema error.
        message: String,
        /// Raw stdout.
        payload: String,
    },
    /// Raised when the process gateway fails (spawn, I/O, cancellation).
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl MultipassError {
    /// Returns `true` when the underlying command was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Process(err) if err.is_cancelled())
    }
}

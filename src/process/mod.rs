//! Process gateway for the external tools jetski drives.
//!
//! Multipass, `ssh`, `sudo route`, and `kubectl` are all opaque processes.
//! This module gives them one seam: a [`CommandRunner`] that can capture
//! output, stream it line-by-line into a [`LineSink`], or hand the terminal
//! over interactively. Every non-interactive call honours a
//! [`CancellationToken`] and an optional timeout.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod runner;
mod sink;

pub use runner::ProcessCommandRunner;
pub use sink::{ConsoleSink, LineSink, NullSink, OutputStream, RelaySink};

/// Future returned by [`CommandRunner`] operations.
pub type RunnerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProcessError>> + Send + 'a>>;

/// How the child's standard input is wired.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum StdinMode {
    /// Connect stdin to `/dev/null`.
    #[default]
    Null,
    /// Share the operator's terminal (needed for `sudo` prompts).
    Inherit,
    /// Write the given text and close the pipe.
    Pipe(String),
}

/// A fully described process invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Standard input wiring.
    pub stdin: StdinMode,
    /// Upper bound on the whole execution, if any.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Starts a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets stdin wiring.
    #[must_use]
    pub fn stdin(mut self, mode: StdinMode) -> Self {
        self.stdin = mode;
        self
    }

    /// Bounds execution time.
    #[must_use]
    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Renders the invocation as a single shell-like string for logs and
    /// assertions. Arguments are not quoted.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running an external command to completion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status (`unknown` when killed by a signal).
    #[must_use]
    pub fn status_text(&self) -> String {
        status_text(self.code)
    }
}

/// Formats an optional exit code for error messages.
#[must_use]
pub fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

/// Errors raised by the process gateway itself. Non-zero exits are not
/// errors at this layer; callers decide what a status means.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when reading output or waiting on the child fails.
    #[error("I/O error while running {program}: {message}")]
    Io {
        /// Command being run.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the configured timeout elapses.
    #[error("{program} did not finish within {}ms", timeout.as_millis())]
    TimedOut {
        /// Command being run.
        program: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Raised when the caller's cancellation token fires.
    #[error("{program} was cancelled")]
    Cancelled {
        /// Command being run.
        program: String,
    },
}

impl ProcessError {
    /// Returns `true` for [`ProcessError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Abstraction over process execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the command cannot be spawned, times
    /// out, or is cancelled. The child is killed in the latter two cases.
    fn capture<'a>(
        &'a self,
        spec: &'a CommandSpec,
        cancel: &'a CancellationToken,
    ) -> RunnerFuture<'a, CommandOutput>;

    /// Runs the command, forwarding each output line to `sink` as it
    /// arrives, and returns the exit code.
    ///
    /// # Errors
    ///
    /// Same as [`CommandRunner::capture`].
    fn stream<'a>(
        &'a self,
        spec: &'a CommandSpec,
        tag: &'a str,
        sink: &'a dyn LineSink,
        cancel: &'a CancellationToken,
    ) -> RunnerFuture<'a, Option<i32>>;

    /// Runs the command attached to the operator's terminal.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] when the command cannot be started.
    fn interactive<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a, Option<i32>>;
}

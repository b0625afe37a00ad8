//! Destinations for streamed process output.

use std::io::{self, Write};

use tokio_util::sync::CancellationToken;

/// Which pipe a line was read from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

/// Receives process output one line at a time.
pub trait LineSink: Send + Sync {
    /// Handles one line (without its terminator) tagged with its source.
    fn line(&self, tag: &str, stream: OutputStream, line: &str);
}

/// Writes `<tag> <line>` to the terminal, keeping stdout and stderr apart.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleSink;

impl LineSink for ConsoleSink {
    fn line(&self, tag: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => writeln!(io::stdout().lock(), "{tag} {line}").ok(),
            OutputStream::Stderr => writeln!(io::stderr().lock(), "{tag} {line}").ok(),
        };
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl LineSink for NullSink {
    fn line(&self, _tag: &str, _stream: OutputStream, _line: &str) {}
}

/// Forwards lines to an inner sink until its relay token is cancelled.
///
/// Cancelling the relay silences the output without touching the process
/// producing it, which keeps running and keeps having its pipes drained.
pub struct RelaySink<'a> {
    inner: &'a dyn LineSink,
    relay: CancellationToken,
}

impl<'a> RelaySink<'a> {
    /// Wraps `inner`, muted once `relay` is cancelled.
    #[must_use]
    pub const fn new(inner: &'a dyn LineSink, relay: CancellationToken) -> Self {
        Self { inner, relay }
    }
}

impl LineSink for RelaySink<'_> {
    fn line(&self, tag: &str, stream: OutputStream, line: &str) {
        if !self.relay.is_cancelled() {
            self.inner.line(tag, stream, line);
        }
    }
}

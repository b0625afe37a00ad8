//! Diagnostic logging setup.
//!
//! Diagnostics go to stderr through `tracing-subscriber`. Relayed process
//! output does not pass through here; it is written by a
//! [`LineSink`](crate::process::LineSink).

use std::io;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "JETSKI_LOG";

/// Filter applied when [`LOG_ENV`] is unset or unparsable.
pub const DEFAULT_DIRECTIVES: &str = "info";

/// Builds the filter from [`LOG_ENV`], falling back to
/// [`DEFAULT_DIRECTIVES`].
#[must_use]
pub fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    let installed = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

//! Host-side routing and split DNS towards the cluster networks.
//!
//! Binding adds a route for the pod and service CIDRs through an instance
//! and points `*.svc.<cluster-domain>` lookups at the cluster DNS. The
//! platform implementation is chosen once, from the Multipass binary name.

use std::future::Future;
use std::pin::Pin;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::process::{CommandRunner, CommandSpec, LineSink, ProcessError, status_text};

mod posix;
mod windows;

pub use posix::PosixBinder;
pub use windows::WindowsBinder;

/// Future returned by [`NetworkBinder::route`].
pub type RouteFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NetworkError>> + Send + 'a>>;

/// Future returned by [`NetworkBinder::unroute`].
pub type UnrouteFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Errors raised while adding routes or DNS stubs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NetworkError {
    /// Raised when a host command exits unsuccessfully.
    #[error("'{command}' exited with status {status_text}")]
    CommandFailure {
        /// Rendered command line.
        command: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
    },
    /// Raised when the process gateway fails.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Adds and removes host routes and DNS stubs for one cluster.
pub trait NetworkBinder: Send + Sync {
    /// Routes the cluster and service CIDRs via `ip` and installs the DNS
    /// stub. Failures propagate.
    fn route<'a>(
        &'a self,
        ip: Ipv4Addr,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> RouteFuture<'a>;

    /// Removes whatever [`NetworkBinder::route`] installed. Failures are
    /// logged and ignored, so calling this with nothing bound is harmless.
    fn unroute<'a>(&'a self, network: &'a NetworkConfig, sink: &'a dyn LineSink)
    -> UnrouteFuture<'a>;
}

/// Host operating system family, as far as routing is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostPlatform {
    /// macOS and Linux (`route`, `/etc/resolver`).
    Posix,
    /// Windows, including WSL driving `multipass.exe`.
    Windows,
}

impl HostPlatform {
    /// Picks the platform from the resolved Multipass binary path.
    #[must_use]
    pub fn from_multipass_binary(bin: &str) -> Self {
        if bin.to_ascii_lowercase().ends_with(".exe") {
            Self::Windows
        } else {
            Self::Posix
        }
    }
}

/// Binder selected at startup for the current host.
#[derive(Clone, Debug)]
pub enum HostBinder<R: CommandRunner> {
    /// POSIX implementation.
    Posix(PosixBinder<R>),
    /// Windows implementation.
    Windows(WindowsBinder<R>),
}

impl<R: CommandRunner> HostBinder<R> {
    /// Builds the binder for `platform`.
    #[must_use]
    pub fn for_platform(platform: HostPlatform, runner: R) -> Self {
        match platform {
            HostPlatform::Posix => Self::Posix(PosixBinder::new(runner)),
            HostPlatform::Windows => Self::Windows(WindowsBinder::new(runner)),
        }
    }
}

impl<R: CommandRunner> NetworkBinder for HostBinder<R> {
    fn route<'a>(
        &'a self,
        ip: Ipv4Addr,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> RouteFuture<'a> {
        match self {
            Self::Posix(binder) => binder.route(ip, network, sink),
            Self::Windows(binder) => binder.route(ip, network, sink),
        }
    }

    fn unroute<'a>(
        &'a self,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> UnrouteFuture<'a> {
        match self {
            Self::Posix(binder) => binder.unroute(network, sink),
            Self::Windows(binder) => binder.unroute(network, sink),
        }
    }
}

/// Runs one host command, relaying output under `tag`.
async fn run_step<R: CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
    tag: &str,
    sink: &dyn LineSink,
) -> Result<(), NetworkError> {
    info!(command = %spec.command_string(), "executing");
    let code = runner
        .stream(spec, tag, sink, &CancellationToken::new())
        .await?;
    if code == Some(0) {
        return Ok(());
    }
    Err(NetworkError::CommandFailure {
        command: spec.command_string(),
        status: code,
        status_text: status_text(code),
    })
}

/// Like [`run_step`] but logs and swallows failures.
async fn run_cleanup_step<R: CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
    tag: &str,
    sink: &dyn LineSink,
) {
    if let Err(err) = run_step(runner, spec, tag, sink).await {
        warn!(error = %err, "ignoring failed network cleanup step");
    }
}

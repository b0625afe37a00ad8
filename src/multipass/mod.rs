//! Typed wrapper over the `multipass` CLI.
//!
//! The hypervisor is slow and eventually consistent, so this client never
//! caches instance state: every [`Multipass::info`] call re-queries. The only
//! thing cached is the binary location, resolved once per client.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process::{
    CommandOutput, CommandRunner, CommandSpec, LineSink, OutputStream, ProcessError,
};

mod error;
mod types;

pub use error::MultipassError;
pub use types::{InstanceInfo, InstanceState, LaunchRequest, Resources};

use types::InfoPayload;

/// Default bound on a single `multipass info` call.
pub const DEFAULT_INFO_TIMEOUT: Duration = Duration::from_secs(3);

/// Tag prefixed to relayed `multipass launch` output.
pub const LAUNCH_TAG: &str = "[$ multipass ]";

/// Cursor-rewind sequence Multipass emits between spinner frames.
const PROGRESS_REWIND: &str = "\u{1b}[2K\u{1b}[0A\u{1b}[0E\u{1b}[2K\u{1b}[0A\u{1b}[0E";

/// Future returned by [`InstanceInspector::inspect`].
pub type InspectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InstanceInfo, MultipassError>> + Send + 'a>>;

/// Read-only view of instance state used by the polling loops.
pub trait InstanceInspector: Send + Sync {
    /// Queries the instance once, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError`] when the query fails, times out, or its
    /// output cannot be parsed.
    fn inspect<'a>(
        &'a self,
        name: &'a str,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> InspectFuture<'a>;
}

/// Client for the local Multipass daemon.
#[derive(Debug)]
pub struct Multipass<R: CommandRunner> {
    runner: R,
    configured_bin: Option<String>,
    located_bin: OnceCell<String>,
    info_timeout: Duration,
}

impl<R: CommandRunner> Multipass<R> {
    /// Creates a client. When `configured_bin` is `None` the binary is
    /// located on first use via `which`.
    #[must_use]
    pub fn new(runner: R, configured_bin: Option<String>) -> Self {
        Self {
            runner,
            configured_bin: configured_bin.filter(|bin| !bin.trim().is_empty()),
            located_bin: OnceCell::new(),
            info_timeout: DEFAULT_INFO_TIMEOUT,
        }
    }

    /// Overrides the bound used by [`Multipass::state`].
    #[must_use]
    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    /// Underlying command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Resolves the Multipass binary, preferring `multipass.exe` so WSL
    /// hosts drive the Windows daemon. A failed lookup is not cached.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::BinaryNotFound`] when neither name resolves.
    pub async fn binary(&self) -> Result<String, MultipassError> {
        if let Some(bin) = &self.configured_bin {
            return Ok(bin.clone());
        }
        self.located_bin
            .get_or_try_init(|| self.locate())
            .await
            .cloned()
    }

    async fn locate(&self) -> Result<String, MultipassError> {
        let cancel = CancellationToken::new();
        for candidate in ["multipass.exe", "multipass"] {
            let spec = CommandSpec::new("which").arg(candidate);
            let output = match self.runner.capture(&spec, &cancel).await {
                Ok(output) => output,
                Err(err) => {
                    debug!(candidate, error = %err, "multipass lookup failed");
                    continue;
                }
            };
            let path = output.stdout.lines().next().unwrap_or_default().trim();
            if output.is_success() && !path.is_empty() {
                debug!(path, "located multipass binary");
                return Ok(path.to_owned());
            }
        }
        Err(MultipassError::BinaryNotFound)
    }

    async fn command<I, S>(&self, args: I) -> Result<CommandSpec, MultipassError>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        Ok(CommandSpec::new(self.binary().await?).args(args))
    }

    async fn run_checked(
        &self,
        spec: CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, MultipassError> {
        info!(command = %spec.command_string(), "executing");
        let output = self.runner.capture(&spec, cancel).await?;
        check_output(&spec, output)
    }

    /// Queries `multipass info <name> --format json`.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::Timeout`] when `timeout` elapses,
    /// [`MultipassError::CommandFailure`] on a non-zero exit, and
    /// [`MultipassError::Parse`] (carrying the raw payload) when the output
    /// is not the expected JSON.
    pub async fn info(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InstanceInfo, MultipassError> {
        let spec = self
            .command(["info", name, "--format", "json"])
            .await?
            .timeout(timeout);
        let output = match self.runner.capture(&spec, cancel).await {
            Ok(output) => output,
            Err(ProcessError::TimedOut { timeout, .. }) => {
                return Err(MultipassError::Timeout {
                    name: name.to_owned(),
                    timeout_ms: timeout.as_millis(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let output = check_output(&spec, output)?;
        parse_info(name, &output.stdout)
    }

    /// Current state, using the client's default info bound.
    ///
    /// # Errors
    ///
    /// See [`Multipass::info`].
    pub async fn state(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceState, MultipassError> {
        Ok(self.info(name, self.info_timeout, cancel).await?.state)
    }

    /// Runs `multipass launch`, relaying its progress output into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] when launch exits
    /// unsuccessfully.
    pub async fn launch(
        &self,
        request: &LaunchRequest,
        sink: &dyn LineSink,
        cancel: &CancellationToken,
    ) -> Result<(), MultipassError> {
        let spec = self.command(launch_args(request)).await?;
        info!(command = %spec.command_string(), "executing");
        let progress = ProgressSink { inner: sink };
        let code = self
            .runner
            .stream(&spec, LAUNCH_TAG, &progress, cancel)
            .await?;
        if code == Some(0) {
            return Ok(());
        }
        Err(MultipassError::CommandFailure {
            command: spec.command_string(),
            status: code,
            status_text: crate::process::status_text(code),
            stderr: String::from("see launch output above"),
        })
    }

    /// Runs `multipass start <name>`.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] on a non-zero exit.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<(), MultipassError> {
        let spec = self.command(["start", name]).await?;
        self.run_checked(spec, cancel).await.map(drop)
    }

    /// Runs `multipass stop <name>`. Never cancelled once issued.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] on a non-zero exit.
    pub async fn stop(&self, name: &str) -> Result<(), MultipassError> {
        let spec = self.command(["stop", name]).await?;
        self.run_checked(spec, &CancellationToken::new())
            .await
            .map(drop)
    }

    /// Runs `multipass suspend <name>`. Never cancelled once issued.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] on a non-zero exit.
    pub async fn suspend(&self, name: &str) -> Result<(), MultipassError> {
        let spec = self.command(["suspend", name]).await?;
        self.run_checked(spec, &CancellationToken::new())
            .await
            .map(drop)
    }

    /// Runs `multipass delete --purge <name>`. Never cancelled once issued.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] on a non-zero exit.
    pub async fn delete(&self, name: &str) -> Result<(), MultipassError> {
        let spec = self.command(["delete", "--purge", name]).await?;
        self.run_checked(spec, &CancellationToken::new())
            .await
            .map(drop)
    }

    /// Applies CPU, memory, and disk settings to a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns [`MultipassError::CommandFailure`] when any `set` fails.
    pub async fn resize(&self, name: &str, resources: Resources) -> Result<(), MultipassError> {
        let cancel = CancellationToken::new();
        let settings = [
            format!("local.{name}.cpus={}", resources.cpus),
            format!("local.{name}.memory={}G", resources.memory_gib),
            format!("local.{name}.disk={}G", resources.disk_gib),
        ];
        for setting in settings {
            let spec = self.command([String::from("set"), setting]).await?;
            self.run_checked(spec, &cancel).await?;
        }
        Ok(())
    }
}

impl<R: CommandRunner> InstanceInspector for Multipass<R> {
    fn inspect<'a>(
        &'a self,
        name: &'a str,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> InspectFuture<'a> {
        Box::pin(self.info(name, timeout, cancel))
    }
}

fn check_output(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput, MultipassError> {
    if output.is_success() {
        return Ok(output);
    }
    Err(MultipassError::CommandFailure {
        command: spec.command_string(),
        status: output.code,
        status_text: output.status_text(),
        stderr: output.stderr.trim().to_owned(),
    })
}

/// Parses `multipass info --format json` output for `name`.
///
/// # Errors
///
/// Returns [`MultipassError::Parse`] when the payload is not JSON, does not
/// match the expected shape, or has no entry for `name`.
pub fn parse_info(name: &str, payload: &str) -> Result<InstanceInfo, MultipassError> {
    let parse_error = |message: String| MultipassError::Parse {
        name: name.to_owned(),
        message,
        payload: payload.to_owned(),
    };
    let mut parsed: InfoPayload =
        serde_json::from_str(payload).map_err(|err| parse_error(err.to_string()))?;
    let entry = parsed
        .info
        .remove(name)
        .ok_or_else(|| parse_error(format!("no entry for instance '{name}'")))?;
    Ok(InstanceInfo {
        name: name.to_owned(),
        state: entry.state,
        ipv4: entry.ipv4,
    })
}

/// Builds the `multipass launch` argument vector.
#[must_use]
pub fn launch_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = vec![String::from("launch")];
    args.extend(request.image.clone());
    args.extend([
        String::from("-v"),
        String::from("-c"),
        request.cpus.to_string(),
        String::from("-m"),
        format!("{}G", request.memory_gib),
        String::from("-d"),
        format!("{}G", request.disk_gib),
        String::from("-n"),
        request.name.clone(),
    ]);
    if request.bridged {
        args.push(String::from("--bridged"));
    }
    args.push(String::from("--cloud-init"));
    args.push(request.cloud_init.to_string());
    args
}

/// Splits spinner redraws into separate lines before relaying them.
struct ProgressSink<'a> {
    inner: &'a dyn LineSink,
}

impl LineSink for ProgressSink<'_> {
    fn line(&self, tag: &str, stream: OutputStream, line: &str) {
        line.split(PROGRESS_REWIND)
            .flat_map(|frame| frame.split('\r'))
            .map(str::trim_end)
            .filter(|frame| !frame.trim().is_empty())
            .for_each(|frame| self.inner.line(tag, stream, frame));
    }
}

//! SSH access to provisioned guests.
//!
//! Guests are disposable, so host keys are neither checked nor remembered.
//! Authentication uses the per-instance ed25519 key generated by [`keys`].

use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::{
    CommandOutput, CommandRunner, CommandSpec, LineSink, ProcessError, StdinMode,
};

pub mod keys;

/// Default SSH client binary.
pub const DEFAULT_SSH_BIN: &str = "ssh";

/// Default guest login user.
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Errors raised while running commands on a guest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the remote command exits unsuccessfully.
    #[error("remote command '{command}' on {host} exited with status {status_text}: {stderr}")]
    RemoteFailure {
        /// Guest address.
        host: Ipv4Addr,
        /// Remote command line.
        command: String,
        /// Exit status reported by `ssh`.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Captured stderr, empty for streamed commands.
        stderr: String,
    },
    /// Raised when the process gateway fails.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Builds and runs `ssh` invocations against one guest user and key.
#[derive(Clone, Debug)]
pub struct SshChannel<R: CommandRunner> {
    runner: R,
    ssh_bin: String,
    user: String,
    identity_file: Utf8PathBuf,
}

impl<R: CommandRunner> SshChannel<R> {
    /// Creates a channel authenticating with `<ssh_dir>/id_ed25519`.
    #[must_use]
    pub fn new(
        runner: R,
        ssh_bin: impl Into<String>,
        user: impl Into<String>,
        ssh_dir: &Utf8Path,
    ) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            user: user.into(),
            identity_file: ssh_dir.join(keys::PRIVATE_KEY_FILE),
        }
    }

    fn options(&self) -> Vec<OsString> {
        [
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-i",
            self.identity_file.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }

    /// Builds the full `ssh` invocation for `remote` on `ip`.
    #[must_use]
    pub fn command(&self, ip: Ipv4Addr, remote: &[&str]) -> CommandSpec {
        CommandSpec::new(self.ssh_bin.clone())
            .args(self.options())
            .arg(format!("{}@{ip}", self.user))
            .args(remote.iter().copied())
    }

    /// Runs `remote` and returns its output without judging the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Process`] when `ssh` cannot run or is cancelled.
    pub async fn capture(
        &self,
        ip: Ipv4Addr,
        remote: &[&str],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SshError> {
        let spec = self.command(ip, remote);
        Ok(self.runner.capture(&spec, cancel).await?)
    }

    /// Runs `remote` and returns stdout, failing on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::RemoteFailure`] on a non-zero exit.
    pub async fn read(
        &self,
        ip: Ipv4Addr,
        remote: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String, SshError> {
        let output = self.capture(ip, remote, cancel).await?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        Err(SshError::RemoteFailure {
            host: ip,
            command: remote.join(" "),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    /// Runs `remote`, relaying its output under `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::RemoteFailure`] on a non-zero exit.
    pub async fn run(
        &self,
        ip: Ipv4Addr,
        remote: &[&str],
        tag: &str,
        sink: &dyn LineSink,
        cancel: &CancellationToken,
    ) -> Result<(), SshError> {
        let spec = self.command(ip, remote);
        let code = self.runner.stream(&spec, tag, sink, cancel).await?;
        if code == Some(0) {
            return Ok(());
        }
        Err(SshError::RemoteFailure {
            host: ip,
            command: remote.join(" "),
            status: code,
            status_text: crate::process::status_text(code),
            stderr: String::new(),
        })
    }

    /// Opens an interactive session, returning the remote exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Process`] when `ssh` cannot be started.
    pub async fn interactive(&self, ip: Ipv4Addr, remote: &[String]) -> Result<Option<i32>, SshError> {
        let remote_refs: Vec<&str> = remote.iter().map(String::as_str).collect();
        let spec = self.command(ip, &remote_refs).stdin(StdinMode::Inherit);
        Ok(self.runner.interactive(&spec).await?)
    }

    /// Checks whether the guest accepts an SSH session within `timeout`.
    ///
    /// Timeouts and failures report `false`; only cancellation is an error.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Process`] when cancelled or `ssh` cannot start.
    pub async fn probe(
        &self,
        ip: Ipv4Addr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, SshError> {
        let connect_timeout = format!("ConnectTimeout={}", timeout.as_secs().max(1));
        let spec = CommandSpec::new(self.ssh_bin.clone())
            .args(["-o", "BatchMode=yes", "-o", connect_timeout.as_str()])
            .args(self.options())
            .arg(format!("{}@{ip}", self.user))
            .arg("true")
            .timeout(timeout);
        match self.runner.capture(&spec, cancel).await {
            Ok(output) => Ok(output.is_success()),
            Err(ProcessError::TimedOut { .. }) => {
                debug!(%ip, "ssh probe timed out");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, Reply, ScriptedHost};
    use rstest::rstest;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 5);

    fn channel(host: &ScriptedHost) -> SshChannel<ScriptedHost> {
        SshChannel::new(
            host.clone(),
            DEFAULT_SSH_BIN,
            DEFAULT_SSH_USER,
            Utf8Path::new("/home/op/.jetski/node-1"),
        )
    }

    #[rstest]
    fn command_disables_host_key_tracking() {
        let spec = channel(&ScriptedHost::new()).command(IP, &["sudo", "cat", "/etc/hostname"]);
        assert_eq!(
            spec.command_string(),
            "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no -i /home/op/.jetski/node-1/id_ed25519 ubuntu@192.168.64.5 sudo cat /etc/hostname"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn read_fails_on_non_zero_exit() {
        let host = ScriptedHost::new();
        host.once("cat /missing", Reply::failure(1, "cat: /missing: No such file\n"));

        let err = channel(&host)
            .read(IP, &["cat", "/missing"], &CancellationToken::new())
            .await
            .expect_err("read should fail");

        assert!(matches!(err, SshError::RemoteFailure { status: Some(1), .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn run_relays_under_tag() {
        let host = ScriptedHost::new();
        host.once("resolvectl", Reply::streaming(["ok"], Duration::ZERO));
        let sink = RecordingSink::default();

        channel(&host)
            .run(IP, &["sudo", "resolvectl", "status"], "[ ssh ]", &sink, &CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("run: {err}"));

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries.iter().all(|entry| entry.tag == "[ ssh ]"));
    }

    #[rstest]
    #[case(Reply::success(""), true)]
    #[case(Reply::failure(255, "Connection refused"), false)]
    #[case(Reply::success("").delayed(Duration::from_secs(5)), false)]
    #[tokio::test]
    async fn probe_reports_reachability(#[case] reply: Reply, #[case] expected: bool) {
        let host = ScriptedHost::new();
        host.once("true", reply);

        let reachable = channel(&host)
            .probe(IP, Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("probe: {err}"));

        assert_eq!(reachable, expected);
        assert!(host.commands().iter().any(|cmd| cmd.contains("ConnectTimeout=1")));
    }
}

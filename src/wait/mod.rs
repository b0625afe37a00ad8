//! Polling loops against the hypervisor and the guest.
//!
//! Every loop sleeps by racing the interval against its cancellation token,
//! so a cancelled wait returns within one tick and never as a timeout.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cidr::{Cidr, select_address};
use crate::multipass::{InstanceInspector, InstanceState};
use crate::process::CommandRunner;
use crate::ssh::{SshChannel, SshError};

/// Bound on each `multipass info` issued while waiting for a state.
pub const STATE_WAIT_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt bound on an SSH readiness probe.
pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const MISSING_INTERFACE_MARKER: &str = "does not exist";

/// Bounded retry schedule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Total number of queries issued before giving up.
    pub attempts: u32,
    /// Pause between queries.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// Observer notified after every state query with the attempt number
/// (starting at 1) and the state seen, if the query succeeded.
pub type AttemptObserver<'a> = &'a (dyn Fn(u32, Option<InstanceState>) + Sync);

/// Errors raised by the polling loops.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// Raised when no acceptable address appeared in time.
    #[error(
        "instance '{name}' reported no matching IPv4 address after {attempts} attempts; last seen: {}",
        format_addresses(.last_seen)
    )]
    IpResolutionTimeout {
        /// Instance name.
        name: String,
        /// Queries issued.
        attempts: u32,
        /// Addresses reported by the final successful query.
        last_seen: Vec<Ipv4Addr>,
    },
    /// Raised when SSH never became reachable.
    #[error("SSH on {host} did not become reachable after {attempts} attempts")]
    SshResolutionTimeout {
        /// Guest address.
        host: Ipv4Addr,
        /// Probes issued.
        attempts: u32,
    },
    /// Raised when the wait's token is cancelled.
    #[error("waiting on instance '{name}' was cancelled")]
    Cancelled {
        /// Instance name.
        name: String,
    },
    /// Raised when a guest command fails in a way retries cannot fix.
    #[error(transparent)]
    Ssh(#[from] SshError),
}

fn format_addresses(addresses: &[Ipv4Addr]) -> String {
    if addresses.is_empty() {
        return String::from("none");
    }
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn cancelled(name: &str) -> WaitError {
    WaitError::Cancelled {
        name: name.to_owned(),
    }
}

async fn pause(interval: Duration, cancel: &CancellationToken, name: &str) -> Result<(), WaitError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(cancelled(name)),
        () = sleep(interval) => Ok(()),
    }
}

/// Polls until the instance reports an address, optionally restricted to
/// `filter`.
///
/// Issues exactly `policy.attempts` queries before giving up. A failed query
/// counts as an attempt that saw no addresses.
///
/// # Errors
///
/// Returns [`WaitError::IpResolutionTimeout`] on exhaustion and
/// [`WaitError::Cancelled`] when `cancel` fires.
pub async fn resolve_ip<I>(
    inspector: &I,
    name: &str,
    filter: Option<&Cidr>,
    policy: PollPolicy,
    info_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Ipv4Addr, WaitError>
where
    I: InstanceInspector + ?Sized,
{
    let mut last_seen = Vec::new();
    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return Err(cancelled(name));
        }

        let addresses = match inspector.inspect(name, info_timeout, cancel).await {
            Ok(info) => {
                last_seen.clone_from(&info.ipv4);
                info.ipv4
            }
            Err(err) if err.is_cancelled() => return Err(cancelled(name)),
            Err(err) => {
                debug!(name, attempt, error = %err, "instance query failed while resolving IP");
                Vec::new()
            }
        };

        if let Some(ip) = select_address(&addresses, filter) {
            return Ok(ip);
        }

        match filter {
            Some(cidr) => info!(
                name,
                %cidr,
                seen = %format_addresses(&addresses),
                "waiting for an IP matching the CIDR filter"
            ),
            None => info!(name, "waiting for the instance to report an IP"),
        }

        if attempt < policy.attempts {
            pause(policy.interval, cancel, name).await?;
        }
    }

    Err(WaitError::IpResolutionTimeout {
        name: name.to_owned(),
        attempts: policy.attempts,
        last_seen,
    })
}

/// Polls until `ready` accepts the instance state.
///
/// There is no attempt bound: only cancellation ends an unsuccessful wait.
/// Failed queries count as "not ready".
///
/// # Errors
///
/// Returns [`WaitError::Cancelled`] when `cancel` fires.
pub async fn wait_for_state<I, P>(
    inspector: &I,
    name: &str,
    ready: P,
    interval: Duration,
    info_timeout: Duration,
    cancel: &CancellationToken,
    on_attempt: Option<AttemptObserver<'_>>,
) -> Result<InstanceState, WaitError>
where
    I: InstanceInspector + ?Sized,
    P: Fn(InstanceState) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(name));
        }
        attempt = attempt.saturating_add(1);

        let state = match inspector.inspect(name, info_timeout, cancel).await {
            Ok(info) => Some(info.state),
            Err(err) if err.is_cancelled() => return Err(cancelled(name)),
            Err(err) => {
                debug!(name, attempt, error = %err, "instance query failed while waiting for state");
                None
            }
        };

        if let Some(observer) = on_attempt {
            observer(attempt, state);
        }

        if let Some(current) = state
            && ready(current)
        {
            return Ok(current);
        }

        pause(interval, cancel, name).await?;
    }
}

/// Probes SSH until the guest accepts a session.
///
/// # Errors
///
/// Returns [`WaitError::SshResolutionTimeout`] on exhaustion and
/// [`WaitError::Cancelled`] when `cancel` fires.
pub async fn wait_for_ssh<R: CommandRunner>(
    channel: &SshChannel<R>,
    name: &str,
    ip: Ipv4Addr,
    policy: PollPolicy,
    attempt_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    for attempt in 1..=policy.attempts {
        match channel.probe(ip, attempt_timeout, cancel).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(name, %ip, attempt, "SSH not reachable yet"),
            Err(SshError::Process(err)) if err.is_cancelled() => return Err(cancelled(name)),
            Err(err) => return Err(err.into()),
        }
        if attempt < policy.attempts {
            pause(policy.interval, cancel, name).await?;
        }
    }
    Err(WaitError::SshResolutionTimeout {
        host: ip,
        attempts: policy.attempts,
    })
}

/// Waits until `ip link show <interface>` succeeds on the guest.
///
/// Polls while the guest reports the interface as missing; any other
/// failure is returned immediately.
///
/// # Errors
///
/// Returns [`WaitError::Ssh`] for unexpected failures and
/// [`WaitError::Cancelled`] when `cancel` fires.
pub async fn wait_for_interface<R: CommandRunner>(
    channel: &SshChannel<R>,
    name: &str,
    ip: Ipv4Addr,
    interface: &str,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    info!(name, interface, "waiting for network interface to be created");
    loop {
        let output = match channel
            .capture(ip, &["ip", "link", "show", interface], cancel)
            .await
        {
            Ok(output) => output,
            Err(SshError::Process(err)) if err.is_cancelled() => return Err(cancelled(name)),
            Err(err) => return Err(err.into()),
        };
        if output.is_success() {
            return Ok(());
        }
        if !output.stderr.contains(MISSING_INTERFACE_MARKER) {
            return Err(WaitError::Ssh(SshError::RemoteFailure {
                host: ip,
                command: format!("ip link show {interface}"),
                status: output.code,
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            }));
        }
        pause(interval, cancel, name).await?;
    }
}

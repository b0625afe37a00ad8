//! Instance lifecycle orchestration.
//!
//! [`Provisioner`] ties the hypervisor client, the SSH channel, the polling
//! loops, and the host network binder together. `create` drives an instance
//! from nothing to a running, reachable, cluster-joined node; the other
//! operations move an existing instance between states and keep host routes
//! in step with it.

use std::fmt;
use std::net::Ipv4Addr;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{InstanceConfig, JetskiConfig, Timings};
use crate::kubeconfig::{DEFAULT_KUBE_DIR, KubeconfigMerger};
use crate::multipass::{InstanceState, Multipass};
use crate::network::NetworkBinder;
use crate::process::{CommandRunner, LineSink};
use crate::ssh::SshChannel;
use crate::wait::{self, PollPolicy};

mod create;
mod error;
mod lifecycle;

pub use error::ProvisionError;

/// Guest interface created by flannel once k3s is up.
pub const CNI_INTERFACE: &str = "cni0";

/// Tag for relayed cloud-init output.
pub const CLOUD_INIT_TAG: &str = "[$ cloud-init ]";

/// Tag for relayed guest commands.
pub const SSH_TAG: &str = "[$ ssh ]";

/// Steps of the `create` workflow, in order. `Failed` can follow any
/// non-terminal phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionPhase {
    /// Nothing has been launched yet.
    NotCreated,
    /// `multipass launch` is being started.
    Launching,
    /// Polling until the hypervisor reports Starting or Running.
    WaitingForRunning,
    /// Launch progress is relayed to the console.
    StreamingLaunchOutput,
    /// Resolving the instance address and waiting for SSH.
    ResolvingIdentity,
    /// Configuring guest DNS, join metadata, kubeconfig, and host routes.
    ConfiguringCluster,
    /// The node is up.
    Ready,
    /// The workflow stopped with an error.
    Failed,
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotCreated => "not-created",
            Self::Launching => "launching",
            Self::WaitingForRunning => "waiting-for-running",
            Self::StreamingLaunchOutput => "streaming-launch-output",
            Self::ResolvingIdentity => "resolving-identity",
            Self::ConfiguringCluster => "configuring-cluster",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Host-side settings the orchestrator needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// Login user when the instance does not set one.
    pub ssh_user: String,
    /// `kubectl` executable.
    pub kubectl_bin: String,
    /// Kubeconfig directory.
    pub kube_dir: String,
    /// Retry budgets and bounds.
    pub timings: Timings,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from(crate::ssh::DEFAULT_SSH_BIN),
            ssh_user: String::from(crate::ssh::DEFAULT_SSH_USER),
            kubectl_bin: String::from("kubectl"),
            kube_dir: String::from(DEFAULT_KUBE_DIR),
            timings: Timings::default(),
        }
    }
}

impl From<&JetskiConfig> for ProvisionSettings {
    fn from(config: &JetskiConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            ssh_user: config.ssh_user.clone(),
            kubectl_bin: config.kubectl_bin.clone(),
            kube_dir: config
                .kube_dir
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_KUBE_DIR)),
            timings: config.timings(),
        }
    }
}

/// Drives instances through create, start, stop, suspend, destroy, reset,
/// refresh, resize, and interactive SSH.
pub struct Provisioner<R, N>
where
    R: CommandRunner + Clone,
    N: NetworkBinder,
{
    multipass: Multipass<R>,
    binder: N,
    settings: ProvisionSettings,
    sink: Box<dyn LineSink>,
}

impl<R, N> Provisioner<R, N>
where
    R: CommandRunner + Clone,
    N: NetworkBinder,
{
    /// Creates an orchestrator relaying process output into `sink`.
    #[must_use]
    pub fn new(
        multipass: Multipass<R>,
        binder: N,
        settings: ProvisionSettings,
        sink: Box<dyn LineSink>,
    ) -> Self {
        Self {
            multipass,
            binder,
            settings,
            sink,
        }
    }

    /// Hypervisor client in use.
    #[must_use]
    pub const fn multipass(&self) -> &Multipass<R> {
        &self.multipass
    }

    fn sink(&self) -> &dyn LineSink {
        self.sink.as_ref()
    }

    const fn timings(&self) -> &Timings {
        &self.settings.timings
    }

    fn channel(&self, instance: &InstanceConfig) -> SshChannel<R> {
        SshChannel::new(
            self.multipass.runner().clone(),
            self.settings.ssh_bin.clone(),
            instance.login_user(&self.settings.ssh_user),
            &instance.ssh_directory_path,
        )
    }

    fn merger(&self) -> KubeconfigMerger<R> {
        KubeconfigMerger::new(
            self.multipass.runner().clone(),
            self.settings.kubectl_bin.clone(),
            &self.settings.kube_dir,
        )
    }

    fn enter(name: &str, phase: ProvisionPhase) {
        info!(instance = name, %phase, "entering phase");
    }

    /// Fails with [`ProvisionError::StateMismatch`] unless the current
    /// state is one of `accepted`.
    async fn require_state(
        &self,
        instance: &InstanceConfig,
        accepted: &[InstanceState],
        cancel: &CancellationToken,
    ) -> Result<InstanceState, ProvisionError> {
        let state = self.multipass.state(instance.name(), cancel).await?;
        if accepted.contains(&state) {
            return Ok(state);
        }
        let expected = accepted
            .iter()
            .map(|state| format!("'{state}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        Err(ProvisionError::StateMismatch {
            name: instance.name().to_owned(),
            expected,
            actual: state,
        })
    }

    /// Resolves the instance address, honouring `external_network_cidr`.
    async fn resolve(
        &self,
        instance: &InstanceConfig,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let ip = wait::resolve_ip(
            &self.multipass,
            instance.name(),
            instance.identity.network.external_network_cidr.as_ref(),
            policy,
            self.timings().info_timeout,
            cancel,
        )
        .await?;
        info!(instance = instance.name(), %ip, "resolved instance IP");
        Ok(ip)
    }

    /// Everything after the instance reports Running: address, SSH, and
    /// cluster-local DNS on the guest.
    async fn post_start(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let name = instance.name();
        let timings = *self.timings();

        Self::enter(name, ProvisionPhase::ResolvingIdentity);
        let ip = self.resolve(instance, timings.ip_resolve, cancel).await?;
        wait::wait_for_ssh(
            channel,
            name,
            ip,
            timings.ssh_probe,
            timings.ssh_probe_timeout,
            cancel,
        )
        .await?;

        Self::enter(name, ProvisionPhase::ConfiguringCluster);
        self.configure_guest_dns(instance, channel, ip, cancel).await?;
        Ok(ip)
    }

    /// Points `*.svc.<domain>` lookups on the guest at the cluster DNS once
    /// the CNI bridge exists.
    async fn configure_guest_dns(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let network = &instance.identity.network;
        wait::wait_for_interface(
            channel,
            instance.name(),
            ip,
            CNI_INTERFACE,
            self.timings().poll_interval,
            cancel,
        )
        .await?;

        info!(domain = %network.cluster_domain, "adding cluster DNS resolution to {CNI_INTERFACE}");
        let domain = format!("~svc.{}", network.cluster_domain);
        let dns_ip = network.cluster_dns_ip.to_string();
        channel
            .run(
                ip,
                &["sudo", "resolvectl", "domain", CNI_INTERFACE, &domain],
                SSH_TAG,
                self.sink(),
                cancel,
            )
            .await?;
        channel
            .run(
                ip,
                &["sudo", "resolvectl", "dns", CNI_INTERFACE, &dns_ip],
                SSH_TAG,
                self.sink(),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Routes the cluster networks through `ip` (servers only). With
    /// `rebind`, stale routes are removed first.
    async fn bind_routes(
        &self,
        instance: &InstanceConfig,
        ip: Ipv4Addr,
        rebind: bool,
    ) -> Result<(), ProvisionError> {
        if !instance.is_server() {
            return Ok(());
        }
        let network = &instance.identity.network;
        if rebind {
            self.binder.unroute(network, self.sink()).await;
        }
        self.binder.route(ip, network, self.sink()).await?;
        Ok(())
    }

    async fn unbind_routes(&self, instance: &InstanceConfig) {
        if instance.is_server() {
            self.binder
                .unroute(&instance.identity.network, self.sink())
                .await;
        }
    }

    /// Merges the bootstrap server's kubeconfig, addressed via the cluster
    /// IP.
    async fn update_kubeconfig(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let cluster_ip = instance.cluster_address(ip);
        self.merger()
            .update(channel, ip, cluster_ip, instance.context_name(), cancel)
            .await?;
        Ok(())
    }
}

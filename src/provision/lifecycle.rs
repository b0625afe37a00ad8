//! State transitions for existing instances.

use std::borrow::Cow;
use std::net::Ipv4Addr;

use shell_escape::unix::escape;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::InstanceConfig;
use crate::multipass::InstanceState;
use crate::network::NetworkBinder;
use crate::process::CommandRunner;

use super::{ProvisionError, Provisioner, SSH_TAG};

const K3S_KILL_ALL: &str = "if which k3s-killall.sh; then k3s-killall.sh; fi";

impl<R, N> Provisioner<R, N>
where
    R: CommandRunner + Clone,
    N: NetworkBinder,
{
    /// Starts a stopped or suspended instance and restores guest DNS,
    /// host routes, and (for the bootstrap server) the kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StateMismatch`] unless the instance is
    /// Stopped or Suspended.
    pub async fn start(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let name = instance.name();
        let previous = self
            .require_state(
                instance,
                &[InstanceState::Stopped, InstanceState::Suspended],
                cancel,
            )
            .await?;
        self.multipass.start(name, cancel).await?;

        let channel = self.channel(instance);
        let ip = self.post_start(instance, &channel, cancel).await?;
        if previous == InstanceState::Suspended {
            info!(instance = name, "restarting chronyd to re-sync time after suspension");
            channel
                .run(
                    ip,
                    &["sudo", "systemctl", "restart", "chronyd"],
                    SSH_TAG,
                    self.sink(),
                    cancel,
                )
                .await?;
        }
        self.bind_routes(instance, ip, true).await?;
        if instance.is_bootstrap() {
            self.update_kubeconfig(instance, &channel, ip, cancel).await?;
        }
        info!(instance = name, %ip, "instance has been started");
        Ok(ip)
    }

    /// Stops a running instance after removing its routes and killing k3s.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StateMismatch`] unless the instance is
    /// Running.
    pub async fn stop(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.require_state(instance, &[InstanceState::Running], cancel)
            .await?;
        self.halt(instance, cancel).await?;
        info!(instance = instance.name(), "instance has been stopped");
        Ok(())
    }

    /// Suspends a running instance after removing its routes.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StateMismatch`] unless the instance is
    /// Running.
    pub async fn suspend(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.require_state(instance, &[InstanceState::Running], cancel)
            .await?;
        self.unbind_routes(instance).await;
        self.multipass.suspend(instance.name()).await?;
        info!(instance = instance.name(), "instance has been suspended");
        Ok(())
    }

    /// Deletes and purges the instance, stopping it cleanly first when it
    /// is running.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the instance cannot be queried,
    /// stopped, or deleted.
    pub async fn destroy(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let name = instance.name();
        let state = self.multipass.state(name, cancel).await?;
        if state == InstanceState::Running {
            info!(instance = name, "stopping running instance before deletion");
            self.halt(instance, cancel).await?;
        }
        self.multipass.delete(name).await?;
        info!(instance = name, "instance has been destroyed");
        Ok(())
    }

    /// Destroys the instance and creates it again.
    ///
    /// # Errors
    ///
    /// See [`Provisioner::destroy`] and [`Provisioner::create`].
    pub async fn reset(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        self.destroy(instance, cancel).await?;
        self.create(instance, cancel).await
    }

    /// Re-resolves a running server's address and rebuilds guest DNS, host
    /// routes, and (for the bootstrap server) the kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] for agents and
    /// [`ProvisionError::StateMismatch`] unless the instance is Running.
    pub async fn refresh(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        if !instance.is_server() {
            return Err(ProvisionError::Validation {
                message: format!(
                    "refresh expects an instance with role server; '{}' is an agent",
                    instance.name()
                ),
            });
        }
        self.require_state(instance, &[InstanceState::Running], cancel)
            .await?;

        let channel = self.channel(instance);
        let ip = self.post_start(instance, &channel, cancel).await?;
        self.bind_routes(instance, ip, true).await?;
        if instance.is_bootstrap() {
            self.update_kubeconfig(instance, &channel, ip, cancel).await?;
        }
        info!(
            instance = instance.name(),
            cluster_ip = %instance.cluster_address(ip),
            "routes and kubeconfig refreshed"
        );
        Ok(ip)
    }

    /// Applies the configured CPU, memory, and disk to a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StateMismatch`] unless the instance is
    /// Stopped.
    pub async fn resize(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.require_state(instance, &[InstanceState::Stopped], cancel)
            .await?;
        self.multipass
            .resize(instance.name(), instance.resources())
            .await?;
        info!(instance = instance.name(), "instance has been resized");
        Ok(())
    }

    /// Opens an interactive SSH session (or runs `command`) on a running
    /// instance and returns the remote exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StateMismatch`] unless the instance is
    /// Running.
    pub async fn ssh(
        &self,
        instance: &InstanceConfig,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<i32>, ProvisionError> {
        self.require_state(instance, &[InstanceState::Running], cancel)
            .await?;
        let ip = self
            .resolve(instance, self.timings().ip_resolve, cancel)
            .await?;
        Ok(self.channel(instance).interactive(ip, command).await?)
    }

    /// Unroutes servers, kills k3s on the guest, and stops the instance.
    /// The guest and hypervisor commands are not cancellable once issued.
    async fn halt(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let name = instance.name();
        let ip = self
            .resolve(instance, self.timings().ip_resolve, cancel)
            .await?;
        self.unbind_routes(instance).await;

        info!(instance = name, "executing k3s-killall.sh over SSH");
        let script = escape(Cow::Borrowed(K3S_KILL_ALL));
        self.channel(instance)
            .run(
                ip,
                &["bash", "-c", &script],
                "[$ k3s-killall.sh ]",
                self.sink(),
                &CancellationToken::new(),
            )
            .await?;
        self.multipass.stop(name).await?;
        Ok(())
    }
}

//! The `create` workflow.

use std::net::Ipv4Addr;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cloud_init;
use crate::config::InstanceConfig;
use crate::join::{self, JoinMetadata};
use crate::multipass::{InstanceState, LaunchRequest};
use crate::network::NetworkBinder;
use crate::process::{CommandRunner, RelaySink};
use crate::ssh::{SshChannel, keys};
use crate::wait;

use super::{CLOUD_INIT_TAG, ProvisionError, ProvisionPhase, Provisioner};

/// Guest log cloud-init writes its progress to.
pub const CLOUD_INIT_LOG: &str = "/var/log/cloud-init-output.log";

/// Join token written by the bootstrap server.
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";

impl<R, N> Provisioner<R, N>
where
    R: CommandRunner + Clone,
    N: NetworkBinder,
{
    /// Launches `instance` and brings it to a running, reachable,
    /// cluster-joined node. Returns the instance address.
    ///
    /// Joining nodes need the bootstrap server's join metadata; without it
    /// nothing is launched. The bootstrap server publishes that metadata
    /// and merges its kubeconfig. Servers finally route the cluster
    /// networks through themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] for the first step that fails. Failures of
    /// the cloud-init log tail are logged and ignored.
    pub async fn create(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let name = instance.name();
        Self::enter(name, ProvisionPhase::NotCreated);
        match self.run_create(instance, cancel).await {
            Ok(ip) => {
                Self::enter(name, ProvisionPhase::Ready);
                info!(instance = name, %ip, "instance is ready");
                Ok(ip)
            }
            Err(err) => {
                Self::enter(name, ProvisionPhase::Failed);
                Err(err)
            }
        }
    }

    async fn run_create(
        &self,
        instance: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let name = instance.name();
        let public_key = keys::ensure_key_pair(
            self.multipass.runner(),
            &instance.ssh_directory_path,
            &format!("jetski@{name}"),
        )
        .await?;

        let join = if instance.is_joining() {
            let metadata = join::read(&instance.join_metadata_path)?;
            info!(instance = name, url = %metadata.url, "joining existing cluster");
            Some(metadata)
        } else {
            None
        };
        let cloud_init = cloud_init::write_temp(instance, &public_key, join.as_ref())?;
        let channel = self.channel(instance);

        Self::enter(name, ProvisionPhase::Launching);
        self.launch_and_follow(instance, &channel, cloud_init.path(), cancel)
            .await?;
        drop(cloud_init);

        self.require_state(instance, &[InstanceState::Running], cancel)
            .await?;
        let ip = self.post_start(instance, &channel, cancel).await?;

        if instance.is_bootstrap() {
            self.publish_join_metadata(instance, &channel, ip, cancel)
                .await?;
            self.update_kubeconfig(instance, &channel, ip, cancel).await?;
        }
        self.bind_routes(instance, ip, false).await?;
        Ok(ip)
    }

    /// Runs `multipass launch` while a second task waits for the instance
    /// to come up and then follows its cloud-init log.
    ///
    /// The launch output is relayed until the instance is first seen
    /// Starting or Running; from then on the console shows the cloud-init
    /// log instead. The log tail stops when the launch command exits.
    async fn launch_and_follow(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        cloud_init: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let name = instance.name();
        let request = LaunchRequest {
            name: name.to_owned(),
            image: instance.image.clone(),
            cpus: instance.cpus,
            memory_gib: instance.memory_gib,
            disk_gib: instance.disk_gib,
            bridged: instance.bridged,
            cloud_init: cloud_init.to_path_buf(),
        };
        let relay = CancellationToken::new();
        let tail = cancel.child_token();
        let relay_sink = RelaySink::new(self.sink(), relay.clone());

        let launch = async {
            Self::enter(name, ProvisionPhase::StreamingLaunchOutput);
            let result = self.multipass.launch(&request, &relay_sink, cancel).await;
            tail.cancel();
            result
        };
        let follow = async {
            Self::enter(name, ProvisionPhase::WaitingForRunning);
            self.follow_cloud_init(instance, channel, &relay, &tail)
                .await
        };
        let (launched, followed) = tokio::join!(launch, follow);

        if let Err(err) = followed {
            debug!(instance = name, error = %err, "cloud-init log tail ended");
        }
        launched?;
        Ok(())
    }

    async fn follow_cloud_init(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        relay: &CancellationToken,
        tail: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let name = instance.name();
        let timings = *self.timings();
        let state = wait::wait_for_state(
            &self.multipass,
            name,
            |state| matches!(state, InstanceState::Starting | InstanceState::Running),
            timings.poll_interval,
            timings.state_wait_info_timeout,
            tail,
            None,
        )
        .await?;
        relay.cancel();
        info!(instance = name, %state, "instance is up; following cloud-init output");

        let ip = self.resolve(instance, timings.ip_resolve, tail).await?;
        wait::wait_for_ssh(
            channel,
            name,
            ip,
            timings.ssh_probe,
            timings.ssh_probe_timeout,
            tail,
        )
        .await?;
        channel
            .run(
                ip,
                &["tail", "-F", "-n", "+1", CLOUD_INIT_LOG],
                CLOUD_INIT_TAG,
                self.sink(),
                tail,
            )
            .await?;
        Ok(())
    }

    /// Reads the bootstrap server's node token and writes the join
    /// metadata other nodes consume.
    async fn publish_join_metadata(
        &self,
        instance: &InstanceConfig,
        channel: &SshChannel<R>,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let token = channel
            .read(ip, &["sudo", "cat", NODE_TOKEN_PATH], cancel)
            .await?;
        let metadata = JoinMetadata::for_cluster(instance.cluster_address(ip), token.trim());
        join::write(&instance.join_metadata_path, &metadata)?;
        info!(
            path = %instance.join_metadata_path,
            url = %metadata.url,
            "wrote join metadata"
        );
        Ok(())
    }
}

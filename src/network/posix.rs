//! `route` and `/etc/resolver` based binding for macOS and Linux hosts.

use std::net::Ipv4Addr;

use tracing::info;

use crate::config::NetworkConfig;
use crate::process::{CommandRunner, CommandSpec, LineSink, StdinMode};

use super::{NetworkBinder, RouteFuture, UnrouteFuture, run_cleanup_step, run_step};

const ROUTE_BIN: &str = "/sbin/route";
const RESOLVER_DIR: &str = "/etc/resolver";
const ROUTE_TAG: &str = "[$ route ]";
const RESOLVER_TAG: &str = "[$ resolver ]";

/// POSIX binder. Every command runs through `sudo` with the operator's
/// terminal attached so password prompts work.
#[derive(Clone, Debug)]
pub struct PosixBinder<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> PosixBinder<R> {
    /// Creates a binder issuing commands through `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }
}

fn sudo<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString>,
{
    CommandSpec::new("sudo").args(args).stdin(StdinMode::Inherit)
}

fn resolver_file(network: &NetworkConfig) -> String {
    format!("{RESOLVER_DIR}/svc.{}", network.cluster_domain)
}

/// Contents of the `/etc/resolver` stub for the cluster's service domain.
#[must_use]
pub fn resolver_stub(network: &NetworkConfig) -> String {
    format!(
        "domain svc.{}\nnameserver {}\nsearch_order 1\n",
        network.cluster_domain, network.cluster_dns_ip
    )
}

impl<R: CommandRunner> NetworkBinder for PosixBinder<R> {
    fn route<'a>(
        &'a self,
        ip: Ipv4Addr,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> RouteFuture<'a> {
        Box::pin(async move {
            info!("adding routes, will require root permissions");
            for cidr in [&network.cluster_cidr, &network.service_cidr] {
                let spec = sudo([
                    ROUTE_BIN.to_owned(),
                    String::from("add"),
                    String::from("-net"),
                    cidr.to_string(),
                    ip.to_string(),
                ]);
                run_step(&self.runner, &spec, ROUTE_TAG, sink).await?;
            }

            run_step(&self.runner, &sudo(["mkdir", "-p", RESOLVER_DIR]), RESOLVER_TAG, sink).await?;
            let tee = CommandSpec::new("sudo")
                .args([String::from("tee"), resolver_file(network)])
                .stdin(StdinMode::Pipe(resolver_stub(network)));
            run_step(&self.runner, &tee, RESOLVER_TAG, sink).await
        })
    }

    fn unroute<'a>(
        &'a self,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> UnrouteFuture<'a> {
        Box::pin(async move {
            info!("removing routes, will require root permissions");
            for cidr in [&network.cluster_cidr, &network.service_cidr] {
                let spec = sudo([
                    ROUTE_BIN.to_owned(),
                    String::from("delete"),
                    String::from("-net"),
                    cidr.to_string(),
                ]);
                run_cleanup_step(&self.runner, &spec, ROUTE_TAG, sink).await;
            }
            let spec = sudo([String::from("rm"), String::from("-f"), resolver_file(network)]);
            run_cleanup_step(&self.runner, &spec, RESOLVER_TAG, sink).await;
        })
    }
}

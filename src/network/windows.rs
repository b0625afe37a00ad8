//! PowerShell based binding for Windows hosts (and WSL driving them).

use std::net::Ipv4Addr;

use tracing::info;

use crate::config::NetworkConfig;
use crate::process::{CommandRunner, CommandSpec, LineSink, StdinMode};

use super::{NetworkBinder, RouteFuture, UnrouteFuture, run_cleanup_step, run_step};

const POWERSHELL_BIN: &str = "powershell.exe";
const INTERFACE_ALIAS: &str = "vEthernet (Default Switch)";

/// Windows binder using `New-NetRoute` and NRPT rules.
#[derive(Clone, Debug)]
pub struct WindowsBinder<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> WindowsBinder<R> {
    /// Creates a binder issuing commands through `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }
}

fn powershell(script: String) -> CommandSpec {
    CommandSpec::new(POWERSHELL_BIN)
        .args([String::from("-NoProfile"), String::from("-Command"), script])
        .stdin(StdinMode::Inherit)
}

fn namespace(network: &NetworkConfig) -> String {
    format!(".svc.{}", network.cluster_domain)
}

impl<R: CommandRunner> NetworkBinder for WindowsBinder<R> {
    fn route<'a>(
        &'a self,
        ip: Ipv4Addr,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> RouteFuture<'a> {
        Box::pin(async move {
            info!("adding routes");
            for cidr in [&network.cluster_cidr, &network.service_cidr] {
                let spec = powershell(format!(
                    "New-NetRoute -DestinationPrefix {cidr} -InterfaceAlias \"{INTERFACE_ALIAS}\" -NextHop {ip}"
                ));
                run_step(&self.runner, &spec, "[$ New-NetRoute ]", sink).await?;
            }

            info!("adding NRPT rule");
            let spec = powershell(format!(
                "Add-DnsClientNrptRule -Namespace \"{}\" -DnsSecEnable -NameServers \"{}\"",
                namespace(network),
                network.cluster_dns_ip
            ));
            run_step(&self.runner, &spec, "[$ Add-DnsClientNrptRule ]", sink).await
        })
    }

    fn unroute<'a>(
        &'a self,
        network: &'a NetworkConfig,
        sink: &'a dyn LineSink,
    ) -> UnrouteFuture<'a> {
        Box::pin(async move {
            info!("removing routes");
            for cidr in [&network.cluster_cidr, &network.service_cidr] {
                let spec = powershell(format!(
                    "Remove-NetRoute -DestinationPrefix {cidr} -Confirm:$false -ErrorAction SilentlyContinue"
                ));
                run_cleanup_step(&self.runner, &spec, "[$ Remove-NetRoute ]", sink).await;
            }

            info!("removing NRPT rule");
            let spec = powershell(format!(
                "Foreach($x in (Get-DnsClientNrptRule | Where-Object {{$_.Namespace -eq \"{}\"}} | foreach {{$_.Name}})){{ Remove-DnsClientNrptRule -Name \"$x\" -Force }}",
                namespace(network)
            ));
            run_cleanup_step(&self.runner, &spec, "[$ Remove-DnsClientNrptRule ]", sink).await;
        })
    }
}

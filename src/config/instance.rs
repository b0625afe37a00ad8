//! Per-instance configuration files.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cidr::Cidr;
use crate::files;
use crate::multipass::Resources;

use super::ConfigError;

/// Role of a node in the k3s cluster.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane node.
    Server,
    /// Worker node.
    Agent,
}

/// Cluster networks an instance participates in.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Pod network.
    pub cluster_cidr: Cidr,
    /// Service network.
    pub service_cidr: Cidr,
    /// Address of the cluster DNS service.
    pub cluster_dns_ip: Ipv4Addr,
    /// Cluster DNS domain, e.g. `cluster.local`.
    pub cluster_domain: String,
    /// Only accept instance addresses inside this range.
    #[serde(default)]
    pub external_network_cidr: Option<Cidr>,
    /// Guest interface flannel should bind to.
    #[serde(default)]
    pub external_network_interface: Option<String>,
}

/// Who an instance is: its hypervisor key, role, and networks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct InstanceIdentity {
    /// Unique hypervisor name.
    pub name: String,
    /// Cluster role.
    pub role: NodeRole,
    /// Cluster networks.
    pub network: NetworkConfig,
}

/// Bundled k3s components that can be switched off (servers only).
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "one switch per bundled k3s component mirrors the k3s `disable` list"
)]
pub struct DisableComponents {
    /// Disable CoreDNS.
    pub coredns: bool,
    /// Disable the service load balancer.
    pub servicelb: bool,
    /// Disable Traefik.
    pub traefik: bool,
    /// Disable the local-path storage provisioner.
    pub local_storage: bool,
    /// Disable metrics-server.
    pub metrics_server: bool,
}

impl DisableComponents {
    /// Names in the form k3s expects for its `disable` list.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.coredns, "coredns"),
            (self.local_storage, "local-storage"),
            (self.metrics_server, "metrics-server"),
            (self.servicelb, "servicelb"),
            (self.traefik, "traefik"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect()
    }

    /// Returns `true` when nothing is disabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

/// Kubelet overrides.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KubeletConfig {
    /// Maximum pods per node.
    #[serde(default)]
    pub max_pods: Option<u32>,
}

/// VRRP role of a keepalived peer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeepalivedState {
    /// Preferred holder of the virtual IP.
    Master,
    /// Standby.
    Backup,
}

/// Floating API address shared by servers (servers only).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeepalivedConfig {
    /// Initial VRRP state.
    pub state: KeepalivedState,
    /// VRRP router id shared by all peers.
    pub virtual_router_id: u8,
    /// Floating address.
    pub virtual_ip: Ipv4Addr,
    /// Election priority.
    pub priority: u8,
    /// VRRP authentication password.
    pub password: String,
}

/// Full description of one instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct InstanceConfig {
    /// Name, role, and networks.
    #[serde(flatten)]
    pub identity: InstanceIdentity,
    /// Image alias; Multipass' default when absent.
    pub image: Option<String>,
    /// Virtual CPUs.
    pub cpus: u32,
    /// Memory in GiB.
    pub memory_gib: u32,
    /// Disk in GiB.
    pub disk_gib: u32,
    /// Attach to the bridged network.
    #[serde(default)]
    pub bridged: bool,
    /// k3s release passed to the installer.
    pub k3s_version: String,
    /// Directory holding the instance SSH key pair.
    pub ssh_directory_path: Utf8PathBuf,
    /// Join metadata file (written by the bootstrap server, read by others).
    pub join_metadata_path: Utf8PathBuf,
    /// Kubeconfig context name; the instance name when absent.
    pub context_name: Option<String>,
    /// Marks the bootstrap server.
    #[serde(default)]
    pub cluster_init: bool,
    /// External datastore (servers only).
    pub datastore_endpoint: Option<String>,
    /// Kubelet overrides.
    pub kubelet: Option<KubeletConfig>,
    /// Bundled components to disable (servers only).
    #[serde(default)]
    pub disable_components: DisableComponents,
    /// Labels applied at registration.
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    /// Taints applied at registration, as `key` to `value:Effect`.
    #[serde(default)]
    pub node_taints: BTreeMap<String, String>,
    /// Login user created on the guest.
    pub user_name: Option<String>,
    /// Password for the login user; the account stays locked when absent.
    pub user_password: Option<String>,
    /// Floating API address (servers only).
    pub keepalived: Option<KeepalivedConfig>,
}

impl InstanceConfig {
    /// Reads, validates, and resolves an instance configuration file.
    ///
    /// YAML and JSON are both accepted. Relative `ssh_directory_path` and
    /// `join_metadata_path` values are resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`], or
    /// [`ConfigError::Validation`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let expanded = Utf8PathBuf::from(files::expand_tilde(path.as_str()));
        let contents = files::read_to_string(&expanded).map_err(|err| ConfigError::Read {
            path: expanded.to_string(),
            message: err.message,
        })?;
        let mut config = Self::parse(&expanded, &contents)?;
        config.validate()?;

        let base = absolute_parent(&expanded)?;
        config.ssh_directory_path = resolve_against(&base, &config.ssh_directory_path);
        config.join_metadata_path = resolve_against(&base, &config.join_metadata_path);
        Ok(config)
    }

    /// Parses YAML or JSON text without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text does not match the schema.
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Checks semantic constraints the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.identity.name)?;
        require_text("k3s_version", &self.k3s_version)?;
        require_text("network.cluster_domain", &self.identity.network.cluster_domain)?;
        require_text("ssh_directory_path", self.ssh_directory_path.as_str())?;
        require_text("join_metadata_path", self.join_metadata_path.as_str())?;
        for (field, value) in [
            ("cpus", self.cpus),
            ("memory_gib", self.memory_gib),
            ("disk_gib", self.disk_gib),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be a positive integer"));
            }
        }
        for (field, value) in [
            ("image", self.image.as_deref()),
            ("context_name", self.context_name.as_deref()),
            ("datastore_endpoint", self.datastore_endpoint.as_deref()),
            ("user_name", self.user_name.as_deref()),
            ("user_password", self.user_password.as_deref()),
            (
                "network.external_network_interface",
                self.identity.network.external_network_interface.as_deref(),
            ),
        ] {
            if let Some(text) = value {
                require_text(field, text)?;
            }
        }
        if let Some(KubeletConfig {
            max_pods: Some(0),
        }) = self.kubelet
        {
            return Err(invalid("kubelet.max_pods", "must be a positive integer"));
        }
        for (key, value) in self.node_labels.iter().chain(&self.node_taints) {
            if key.trim().is_empty() || value.trim().is_empty() {
                return Err(invalid(
                    "node_labels/node_taints",
                    "keys and values must not be empty",
                ));
            }
        }

        match self.identity.role {
            NodeRole::Server => self.validate_server(),
            NodeRole::Agent => self.validate_agent(),
        }
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if let Some(keepalived) = &self.keepalived {
            if keepalived.virtual_router_id == 0 {
                return Err(invalid("keepalived.virtual_router_id", "must be a positive integer"));
            }
            if keepalived.priority == 0 {
                return Err(invalid("keepalived.priority", "must be a positive integer"));
            }
            require_text("keepalived.password", &keepalived.password)?;
            if self.identity.network.external_network_interface.is_none() {
                return Err(invalid(
                    "network.external_network_interface",
                    "is required when keepalived is set",
                ));
            }
        }
        Ok(())
    }

    fn validate_agent(&self) -> Result<(), ConfigError> {
        let server_only = [
            ("cluster_init", self.cluster_init),
            ("context_name", self.context_name.is_some()),
            ("datastore_endpoint", self.datastore_endpoint.is_some()),
            ("disable_components", !self.disable_components.is_empty()),
            ("keepalived", self.keepalived.is_some()),
        ];
        match server_only.into_iter().find(|(_, present)| *present) {
            Some((field, _)) => Err(invalid(field, "is only valid for role 'server'")),
            None => Ok(()),
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Returns `true` for servers.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.identity.role == NodeRole::Server
    }

    /// Returns `true` for the server that initialises the cluster.
    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        self.is_server() && self.cluster_init
    }

    /// Returns `true` for nodes that need join metadata: agents, and servers
    /// joining an existing cluster.
    #[must_use]
    pub fn is_joining(&self) -> bool {
        !self.is_bootstrap()
    }

    /// Kubeconfig context name.
    #[must_use]
    pub fn context_name(&self) -> &str {
        self.context_name.as_deref().unwrap_or(&self.identity.name)
    }

    /// Address the cluster API is reached on: the keepalived virtual IP when
    /// configured, otherwise the instance address.
    #[must_use]
    pub fn cluster_address(&self, instance_ip: Ipv4Addr) -> Ipv4Addr {
        self.keepalived
            .as_ref()
            .map_or(instance_ip, |keepalived| keepalived.virtual_ip)
    }

    /// Login user for SSH, falling back to `default_user`.
    #[must_use]
    pub fn login_user<'a>(&'a self, default_user: &'a str) -> &'a str {
        self.user_name.as_deref().unwrap_or(default_user)
    }

    /// Hypervisor resources.
    #[must_use]
    pub const fn resources(&self) -> Resources {
        Resources {
            cpus: self.cpus,
            memory_gib: self.memory_gib,
            disk_gib: self.disk_gib,
        }
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.to_owned(),
        message: message.to_owned(),
    }
}

fn require_text(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

/// Multipass names: a letter, then letters, digits, or hyphens, not ending
/// in a hyphen.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|first| first.is_ascii_alphabetic());
    let body_ok = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !starts_with_letter || !body_ok || name.ends_with('-') {
        return Err(invalid(
            "name",
            "must start with a letter and contain only letters, digits, and hyphens",
        ));
    }
    Ok(())
}

fn absolute_parent(path: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    if parent.is_absolute() {
        return Ok(parent.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .ok_or_else(|| ConfigError::Read {
            path: path.to_string(),
            message: String::from("current directory is not valid UTF-8"),
        })?;
    Ok(cwd.join(parent))
}

fn resolve_against(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let expanded = Utf8PathBuf::from(files::expand_tilde(path.as_str()));
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

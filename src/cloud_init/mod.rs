//! `#cloud-config` generation for new instances.
//!
//! The document creates the login user, drops the k3s configuration files in
//! place, and installs k3s. Joining nodes get the supervisor URL and token
//! baked into the install command, so the guest joins the cluster on first
//! boot without further orchestration.

use std::borrow::Cow;
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use shell_escape::unix::escape;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{InstanceConfig, KeepalivedConfig, KeepalivedState};
use crate::files::{self, FileError};
use crate::join::JoinMetadata;

/// Default login user when the instance does not name one.
pub const DEFAULT_USER: &str = "ubuntu";

const K3S_CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";
const SYSCTL_PATH: &str = "/etc/sysctl.d/98-inotify.conf";
const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";
const KUBELET_CONFIG_PATH: &str = "/etc/rancher/k3s/kubelet-config.yaml";
const KEEPALIVED_CONFIG_PATH: &str = "/etc/keepalived/keepalived.conf";
const INOTIFY_LIMIT: u32 = 122_425;
const FILE_NAME: &str = "cloud-init.yaml";

/// Errors raised while producing the cloud-init document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudInitError {
    /// Raised when a joining node is rendered without join metadata.
    #[error("instance {name} joins an existing cluster but no join metadata was supplied")]
    MissingJoin {
        /// Instance name.
        name: String,
    },
    /// Raised when serialisation fails.
    #[error("failed to render cloud-init: {message}")]
    Render {
        /// Serializer error message.
        message: String,
    },
    /// Raised when the scratch directory cannot be created.
    #[error("failed to create a temporary directory for cloud-init: {message}")]
    TempDir {
        /// Underlying error message.
        message: String,
    },
    /// Raised when the rendered file cannot be written.
    #[error("failed to write cloud-init: {0}")]
    File(#[from] FileError),
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    users: Vec<UserEntry<'a>>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
    package_update: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum UserEntry<'a> {
    Default(&'static str),
    User(Box<UserSpec<'a>>),
}

#[derive(Serialize)]
struct UserSpec<'a> {
    name: &'a str,
    gecos: &'a str,
    sudo: &'static str,
    groups: &'static str,
    shell: &'static str,
    ssh_import_id: &'static str,
    lock_passwd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_text_passwd: Option<&'a str>,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Serialize)]
struct WriteFile {
    owner: &'static str,
    path: &'static str,
    content: String,
}

impl WriteFile {
    const fn root_owned(path: &'static str, content: String) -> Self {
        Self {
            owner: "root:root",
            path,
            content,
        }
    }
}

#[derive(Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct K3sConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    write_kubeconfig_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_init: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datastore_endpoint: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tls_san: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    node_label: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    node_taint: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flannel_iface: Option<&'a str>,
}

#[derive(Serialize)]
struct Registries {
    mirrors: BTreeMap<String, Mirror>,
}

#[derive(Serialize)]
struct Mirror {
    endpoint: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletFile {
    api_version: &'static str,
    kind: &'static str,
    max_pods: u32,
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String, CloudInitError> {
    serde_yaml::to_string(value).map_err(|err| CloudInitError::Render {
        message: err.to_string(),
    })
}

fn pairs(map: &BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(key, value)| format!("{key}={value}")).collect()
}

fn k3s_config(instance: &InstanceConfig) -> K3sConfig<'_> {
    let network = &instance.identity.network;
    let mut config = K3sConfig {
        node_label: pairs(&instance.node_labels),
        node_taint: pairs(&instance.node_taints),
        flannel_iface: network.external_network_interface.as_deref(),
        ..K3sConfig::default()
    };
    if instance.is_server() {
        config.write_kubeconfig_mode = Some("0644");
        config.cluster_cidr = Some(network.cluster_cidr.to_string());
        config.service_cidr = Some(network.service_cidr.to_string());
        config.cluster_dns = Some(network.cluster_dns_ip.to_string());
        config.cluster_domain = Some(&network.cluster_domain);
        config.disable = Some(instance.disable_components.names());
        config.datastore_endpoint = instance.datastore_endpoint.as_deref();
        config.cluster_init = (instance.is_bootstrap() && instance.datastore_endpoint.is_none())
            .then_some(true);
        if let Some(keepalived) = &instance.keepalived {
            config.tls_san.push(keepalived.virtual_ip.to_string());
        }
    }
    config
}

/// Renders the `keepalived.conf` advertising the floating API address.
#[must_use]
pub fn keepalived_conf(keepalived: &KeepalivedConfig, interface: &str) -> String {
    let state = match keepalived.state {
        KeepalivedState::Master => "MASTER",
        KeepalivedState::Backup => "BACKUP",
    };
    format!(
        "vrrp_instance k3s_api {{\n    state {state}\n    interface {interface}\n    virtual_router_id {}\n    priority {}\n    advert_int 1\n    authentication {{\n        auth_type PASS\n        auth_pass {}\n    }}\n    virtual_ipaddress {{\n        {}\n    }}\n}}\n",
        keepalived.virtual_router_id, keepalived.priority, keepalived.password, keepalived.virtual_ip
    )
}

fn write_files(instance: &InstanceConfig) -> Result<Vec<WriteFile>, CloudInitError> {
    let domain = &instance.identity.network.cluster_domain;
    let registry = format!("docker-registry.registry.svc.{domain}");
    let registries = Registries {
        mirrors: BTreeMap::from([(
            registry.clone(),
            Mirror {
                endpoint: vec![format!("http://{registry}")],
            },
        )]),
    };

    let mut files = vec![
        WriteFile::root_owned(K3S_CONFIG_PATH, to_yaml(&k3s_config(instance))?),
        WriteFile::root_owned(
            SYSCTL_PATH,
            format!(
                "fs.inotify.max_user_watches = {INOTIFY_LIMIT}\nfs.inotify.max_user_instances = {INOTIFY_LIMIT}\n"
            ),
        ),
        WriteFile::root_owned(REGISTRIES_PATH, to_yaml(&registries)?),
    ];
    if let Some(max_pods) = instance.kubelet.and_then(|kubelet| kubelet.max_pods) {
        let kubelet = KubeletFile {
            api_version: "kubelet.config.k8s.io/v1beta1",
            kind: "KubeletConfiguration",
            max_pods,
        };
        files.push(WriteFile::root_owned(KUBELET_CONFIG_PATH, to_yaml(&kubelet)?));
    }
    if let Some(keepalived) = &instance.keepalived {
        let interface = instance
            .identity
            .network
            .external_network_interface
            .as_deref()
            .unwrap_or("eth0");
        files.push(WriteFile::root_owned(
            KEEPALIVED_CONFIG_PATH,
            keepalived_conf(keepalived, interface),
        ));
    }
    Ok(files)
}

/// Builds the k3s installer invocation for the instance's role.
///
/// # Errors
///
/// Returns [`CloudInitError::MissingJoin`] when a joining node has no join
/// metadata.
pub fn install_command(
    instance: &InstanceConfig,
    join: Option<&JoinMetadata>,
) -> Result<String, CloudInitError> {
    let mut env = vec![format!(
        "INSTALL_K3S_VERSION={}",
        escape(Cow::Borrowed(instance.k3s_version.as_str()))
    )];
    if instance.kubelet.is_some_and(|kubelet| kubelet.max_pods.is_some()) {
        env.push(format!(
            "INSTALL_K3S_EXEC={}",
            escape(Cow::Owned(format!("--kubelet-arg=config={KUBELET_CONFIG_PATH}")))
        ));
    }

    let join = match (instance.is_joining(), join) {
        (false, _) => None,
        (true, Some(join)) => Some(join),
        (true, None) => {
            return Err(CloudInitError::MissingJoin {
                name: instance.name().to_owned(),
            });
        }
    };
    let url = join.map(|join| escape(Cow::Borrowed(join.url.as_str())));
    if let Some(join) = join {
        if !instance.is_server()
            && let Some(url) = &url
        {
            env.push(format!("K3S_URL={url}"));
        }
        env.push(format!("K3S_TOKEN={}", escape(Cow::Borrowed(join.token.as_str()))));
    }

    let mut command = format!("curl -sfL https://get.k3s.io | {} sh -s -", env.join(" "));
    if instance.is_server() {
        command.push_str(" server");
        if let Some(url) = url {
            command.push_str(" --server ");
            command.push_str(&url);
        }
    } else {
        command.push_str(" agent");
    }
    Ok(command)
}

/// Renders the full `#cloud-config` document.
///
/// # Errors
///
/// Returns [`CloudInitError`] when a joining node lacks join metadata or
/// serialisation fails.
pub fn render(
    instance: &InstanceConfig,
    ssh_public_key: &str,
    join: Option<&JoinMetadata>,
) -> Result<String, CloudInitError> {
    let user_name = instance.login_user(DEFAULT_USER);
    let user = UserSpec {
        name: user_name,
        gecos: user_name,
        sudo: "ALL=(ALL) NOPASSWD:ALL",
        groups: "users, admin",
        shell: "/bin/bash",
        ssh_import_id: "None",
        lock_passwd: instance.user_password.is_none(),
        plain_text_passwd: instance.user_password.as_deref(),
        ssh_authorized_keys: vec![ssh_public_key.trim()],
    };

    let mut runcmd = vec![format!("sysctl -p {SYSCTL_PATH}")];
    if instance.keepalived.is_some() {
        runcmd.push(String::from(
            "apt-get update && apt-get install -y keepalived && systemctl enable --now keepalived",
        ));
    }
    runcmd.push(install_command(instance, join)?);

    let document = CloudConfig {
        users: vec![UserEntry::Default("default"), UserEntry::User(Box::new(user))],
        write_files: write_files(instance)?,
        runcmd,
        package_update: false,
    };
    Ok(format!("#cloud-config\n{}", to_yaml(&document)?))
}

/// A rendered cloud-init file inside a scratch directory. The directory is
/// removed when this value is dropped.
#[derive(Debug)]
pub struct CloudInitFile {
    _dir: TempDir,
    path: Utf8PathBuf,
}

impl CloudInitFile {
    /// Location of the rendered file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Renders the document and writes it to a fresh temporary directory.
///
/// # Errors
///
/// Returns [`CloudInitError`] when rendering fails or the file cannot be
/// written.
pub fn write_temp(
    instance: &InstanceConfig,
    ssh_public_key: &str,
    join: Option<&JoinMetadata>,
) -> Result<CloudInitFile, CloudInitError> {
    let document = render(instance, ssh_public_key, join)?;
    let dir = tempfile::Builder::new()
        .prefix("jetski-")
        .tempdir()
        .map_err(|err| CloudInitError::TempDir {
            message: err.to_string(),
        })?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
        CloudInitError::TempDir {
            message: format!("{} is not valid UTF-8", path.display()),
        }
    })?;
    let path = root.join(FILE_NAME);
    files::write(&path, &document)?;

    info!(path = %path, "generated cloud-init");
    debug!("cloud-init document:\n{document}");
    Ok(CloudInitFile { _dir: dir, path })
}

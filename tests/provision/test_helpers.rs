//! Shared fixtures for provisioning scenarios.

use std::cell::RefCell;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use jetski::config::{InstanceConfig, Timings};
use jetski::network::PosixBinder;
use jetski::provision::{ProvisionError, ProvisionSettings, Provisioner};
use jetski::test_support::ScriptedHost;
use jetski::wait::PollPolicy;
use jetski::Multipass;
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::Runtime;

pub static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start for scenarios: {err}"))
});

pub const K3S_YAML: &str = r"apiVersion: v1
clusters:
- cluster:
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
users:
- name: default
  user:
    token: abc
";

const NETWORK: &str = "network:
  cluster_cidr: 10.42.0.0/16
  service_cidr: 10.43.0.0/16
  cluster_dns_ip: 10.43.0.10
  cluster_domain: cluster.local
";

pub type ScenarioProvisioner = Provisioner<ScriptedHost, PosixBinder<ScriptedHost>>;

/// State shared by the steps of one scenario.
pub struct ProvisionWorld {
    pub host: ScriptedHost,
    pub root: Utf8PathBuf,
    pub outcome: RefCell<Option<Result<(), ProvisionError>>>,
    _tmp: Arc<TempDir>,
}

impl ProvisionWorld {
    fn new() -> Self {
        let tmp = Arc::new(
            TempDir::new().unwrap_or_else(|err| panic!("scenario temp dir should exist: {err}")),
        );
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be UTF-8: {}", path.display()));

        write_file(&root.join("keys/id_ed25519"), "private");
        write_file(&root.join("keys/id_ed25519.pub"), "ssh-ed25519 AAAA jetski\n");
        write_file(
            &root.join("alpha.yaml"),
            &format!(
                "name: alpha\nrole: server\ncpus: 2\nmemory_gib: 4\ndisk_gib: 20\nk3s_version: v1.29.4+k3s1\nssh_directory_path: keys\njoin_metadata_path: join.json\ncluster_init: true\n{NETWORK}"
            ),
        );
        write_file(
            &root.join("bravo.yaml"),
            &format!(
                "name: bravo\nrole: agent\ncpus: 1\nmemory_gib: 2\ndisk_gib: 10\nk3s_version: v1.29.4+k3s1\nssh_directory_path: keys\njoin_metadata_path: join.json\n{NETWORK}"
            ),
        );

        Self {
            host: ScriptedHost::new(),
            root,
            outcome: RefCell::new(None),
            _tmp: tmp,
        }
    }

    pub fn instance(&self, name: &str) -> InstanceConfig {
        InstanceConfig::load(&self.root.join(format!("{name}.yaml")))
            .unwrap_or_else(|err| panic!("instance {name} should load: {err}"))
    }

    pub fn join_path(&self) -> Utf8PathBuf {
        self.root.join("join.json")
    }

    pub fn provisioner(&self) -> ScenarioProvisioner {
        let interval = Duration::from_millis(10);
        let timings = Timings {
            poll_interval: interval,
            ip_resolve: PollPolicy {
                attempts: 5,
                interval,
            },
            ssh_probe: PollPolicy {
                attempts: 5,
                interval,
            },
            ssh_probe_timeout: Duration::from_secs(1),
            info_timeout: Duration::from_secs(1),
            state_wait_info_timeout: Duration::from_secs(1),
        };
        let settings = ProvisionSettings {
            kube_dir: self.root.join("kube").to_string(),
            timings,
            ..ProvisionSettings::default()
        };
        Provisioner::new(
            Multipass::new(self.host.clone(), Some(String::from("multipass"))),
            PosixBinder::new(self.host.clone()),
            settings,
            Box::new(self.host.sink()),
        )
    }

    pub fn record(&self, outcome: Result<(), ProvisionError>) {
        self.outcome.replace(Some(outcome));
    }
}

fn write_file(path: &Utf8Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("create parent directories for {path}: {err}"));
    }
    fs::write(path, contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
}

pub fn parse_ip(value: &str) -> Ipv4Addr {
    value
        .parse()
        .unwrap_or_else(|err| panic!("step should name an IPv4 address, got {value}: {err}"))
}

#[fixture]
pub fn provision_world() -> ProvisionWorld {
    ProvisionWorld::new()
}

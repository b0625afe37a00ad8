//! Integration tests for loading instance configuration files.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use jetski::NodeRole;
use jetski::config::{ConfigError, InstanceConfig};
use jetski::test_support::EnvGuard;
use rstest::*;
use tempfile::TempDir;

const AGENT_YAML: &str = "name: worker-1
role: agent
cpus: 2
memory_gib: 2
disk_gib: 15
k3s_version: v1.29.4+k3s1
ssh_directory_path: ssh
join_metadata_path: ../shared/join.json
node_labels:
  pool: batch
network:
  cluster_cidr: 10.42.0.0/16
  service_cidr: 10.43.0.0/16
  cluster_dns_ip: 10.43.0.10
  cluster_domain: cluster.local
  external_network_cidr: 192.168.1.0/24
";

struct Home {
    _dir: TempDir,
    root: Utf8PathBuf,
    fs: Dir,
}

#[fixture]
fn home() -> Home {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp home dir should be utf8: {}", path.display()));
    let fs = Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp home dir: {err}"));
    Home {
        _dir: dir,
        root,
        fs,
    }
}

#[rstest]
#[tokio::test]
async fn config_path_expands_tilde_and_resolves_relative_paths(home: Home) {
    home.fs
        .create_dir_all("nodes")
        .unwrap_or_else(|err| panic!("create nodes dir: {err}"));
    home.fs
        .write("nodes/worker-1.yaml", AGENT_YAML)
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let _guard = EnvGuard::set_vars(&[("HOME", home.root.as_str())]).await;

    let config = InstanceConfig::load(Utf8Path::new("~/nodes/worker-1.yaml"))
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(config.identity.role, NodeRole::Agent);
    assert_eq!(config.ssh_directory_path, home.root.join("nodes/ssh"));
    assert_eq!(
        config.join_metadata_path,
        home.root.join("nodes/../shared/join.json")
    );
    assert_eq!(
        config.node_labels.get("pool").map(String::as_str),
        Some("batch")
    );
    assert!(config.is_joining());
}

#[rstest]
fn json_configs_are_accepted(home: Home) {
    let json = r#"{
        "name": "edge",
        "role": "server",
        "cpus": 4,
        "memory_gib": 8,
        "disk_gib": 40,
        "k3s_version": "v1.29.4+k3s1",
        "ssh_directory_path": "/var/lib/jetski/edge",
        "join_metadata_path": "/var/lib/jetski/join.json",
        "cluster_init": true,
        "network": {
            "cluster_cidr": "10.42.0.0/16",
            "service_cidr": "10.43.0.0/16",
            "cluster_dns_ip": "10.43.0.10",
            "cluster_domain": "cluster.local"
        }
    }"#;
    home.fs
        .write("edge.json", json)
        .unwrap_or_else(|err| panic!("write config: {err}"));

    let config = InstanceConfig::load(&home.root.join("edge.json"))
        .unwrap_or_else(|err| panic!("json config should load: {err}"));

    assert!(config.is_bootstrap());
    assert_eq!(config.context_name(), "edge");
}

#[rstest]
fn schema_errors_name_the_file(home: Home) {
    home.fs
        .write("broken.yaml", "name: broken\nrole: server\ncpus: lots\n")
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let path = home.root.join("broken.yaml");

    let err = InstanceConfig::load(&path).expect_err("schema violations should fail");

    let ConfigError::Parse { path: reported, .. } = err else {
        panic!("expected a parse error, got {err:?}");
    };
    assert_eq!(reported, path.to_string());
}

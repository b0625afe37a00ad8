//! Tool settings and instance configuration tests.

use std::net::Ipv4Addr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::EnvGuard;

const SERVER_YAML: &str = r"
name: alpha
role: server
cpus: 2
memory_gib: 4
disk_gib: 20
k3s_version: v1.29.4+k3s1
ssh_directory_path: keys
join_metadata_path: state/join.json
cluster_init: true
network:
  cluster_cidr: 10.42.0.0/16
  service_cidr: 10.43.0.0/16
  cluster_dns_ip: 10.43.0.10
  cluster_domain: cluster.local
  external_network_cidr: 192.168.64.0/24
disable_components:
  traefik: true
  coredns: true
node_labels:
  tier: edge
";

const AGENT_JSON: &str = r#"{
  "name": "bravo",
  "role": "agent",
  "cpus": 1,
  "memory_gib": 2,
  "disk_gib": 10,
  "k3s_version": "v1.29.4+k3s1",
  "ssh_directory_path": "/var/keys",
  "join_metadata_path": "/var/join.json",
  "network": {
    "cluster_cidr": "10.42.0.0/16",
    "service_cidr": "10.43.0.0/16",
    "cluster_dns_ip": "10.43.0.10",
    "cluster_domain": "cluster.local"
  }
}"#;

#[fixture]
fn server() -> InstanceConfig {
    InstanceConfig::parse(Utf8Path::new("server.yaml"), SERVER_YAML)
        .unwrap_or_else(|err| panic!("server fixture should parse: {err}"))
}

#[fixture]
fn agent() -> InstanceConfig {
    InstanceConfig::parse(Utf8Path::new("agent.json"), AGENT_JSON)
        .unwrap_or_else(|err| panic!("agent fixture should parse: {err}"))
}

fn write_config(contents: &str) -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 temp dir: {}", path.display()));
    let path = root.join("instance.yaml");
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write config: {err}"));
    (dir, path)
}

fn validation_field(err: &ConfigError) -> &str {
    let ConfigError::Validation { field, .. } = err else {
        panic!("expected Validation, got {err:?}");
    };
    field
}

#[rstest]
fn parses_server_yaml(server: InstanceConfig) {
    assert_eq!(server.name(), "alpha");
    assert!(server.is_bootstrap());
    assert!(!server.is_joining());
    assert_eq!(server.identity.network.cluster_cidr.to_string(), "10.42.0.0/16");
    assert_eq!(
        server.identity.network.cluster_dns_ip,
        Ipv4Addr::new(10, 43, 0, 10)
    );
    assert_eq!(server.disable_components.names(), vec!["coredns", "traefik"]);
    assert_eq!(server.node_labels.get("tier").map(String::as_str), Some("edge"));
    assert!(server.validate().is_ok());
}

#[rstest]
fn parses_agent_json(agent: InstanceConfig) {
    assert_eq!(agent.identity.role, NodeRole::Agent);
    assert!(agent.is_joining());
    assert_eq!(agent.context_name(), "bravo");
    assert_eq!(agent.login_user("ubuntu"), "ubuntu");
    assert!(agent.validate().is_ok());
}

#[test]
fn disable_names_follow_k3s_order() {
    let all = DisableComponents {
        coredns: true,
        servicelb: true,
        traefik: true,
        local_storage: true,
        metrics_server: true,
    };
    assert_eq!(
        all.names(),
        vec!["coredns", "local-storage", "metrics-server", "servicelb", "traefik"]
    );
    assert!(DisableComponents::default().is_empty());
}

#[rstest]
fn rejects_malformed_cidr() {
    let yaml = SERVER_YAML.replace("10.42.0.0/16", "10.42.0.0");
    let err = InstanceConfig::parse(Utf8Path::new("bad.yaml"), &yaml)
        .expect_err("missing prefix should fail");
    assert!(matches!(err, ConfigError::Parse { .. }), "got {err:?}");
}

#[rstest]
fn rejects_unknown_role() {
    let yaml = SERVER_YAML.replace("role: server", "role: leader");
    let err = InstanceConfig::parse(Utf8Path::new("bad.yaml"), &yaml)
        .expect_err("unknown role should fail");
    assert!(matches!(err, ConfigError::Parse { .. }), "got {err:?}");
}

#[rstest]
#[case::leading_digit("1alpha")]
#[case::trailing_hyphen("alpha-")]
#[case::underscore("al_pha")]
#[case::empty("")]
fn rejects_invalid_names(mut server: InstanceConfig, #[case] name: &str) {
    server.identity.name = name.to_owned();
    let err = server.validate().expect_err("name should be rejected");
    assert_eq!(validation_field(&err), "name");
}

#[rstest]
fn rejects_zero_resources(mut server: InstanceConfig) {
    server.memory_gib = 0;
    let err = server.validate().expect_err("zero memory should fail");
    assert_eq!(validation_field(&err), "memory_gib");
}

#[rstest]
#[case::cluster_init("cluster_init")]
#[case::context_name("context_name")]
#[case::datastore("datastore_endpoint")]
#[case::disable("disable_components")]
#[case::keepalived("keepalived")]
fn agents_reject_server_only_fields(mut agent: InstanceConfig, #[case] field: &str) {
    match field {
        "cluster_init" => agent.cluster_init = true,
        "context_name" => agent.context_name = Some(String::from("ctx")),
        "datastore_endpoint" => agent.datastore_endpoint = Some(String::from("mysql://db")),
        "disable_components" => agent.disable_components.traefik = true,
        _ => {
            agent.keepalived = Some(KeepalivedConfig {
                state: KeepalivedState::Master,
                virtual_router_id: 51,
                virtual_ip: Ipv4Addr::new(192, 168, 64, 100),
                priority: 100,
                password: String::from("secret"),
            });
        }
    }
    let err = agent.validate().expect_err("server-only field should fail");
    assert_eq!(validation_field(&err), field);
}

#[rstest]
fn keepalived_virtual_ip_is_the_cluster_address(mut server: InstanceConfig) {
    let instance_ip = Ipv4Addr::new(192, 168, 64, 5);
    assert_eq!(server.cluster_address(instance_ip), instance_ip);

    let yaml = format!(
        "{SERVER_YAML}keepalived:\n  state: BACKUP\n  virtual_router_id: 7\n  virtual_ip: 192.168.64.100\n  priority: 90\n  password: hunter2\n"
    );
    server = InstanceConfig::parse(Utf8Path::new("vip.yaml"), &yaml)
        .unwrap_or_else(|err| panic!("keepalived yaml should parse: {err}"));
    let err = server.validate().expect_err("keepalived needs an interface");
    assert_eq!(validation_field(&err), "network.external_network_interface");

    server.identity.network.external_network_interface = Some(String::from("enp0s2"));
    assert!(server.validate().is_ok());
    assert_eq!(
        server.keepalived.as_ref().map(|keepalived| keepalived.state),
        Some(KeepalivedState::Backup)
    );
    assert_eq!(
        server.cluster_address(instance_ip),
        Ipv4Addr::new(192, 168, 64, 100)
    );
}

#[test]
fn load_resolves_relative_paths_against_the_file() {
    let (_dir, path) = write_config(SERVER_YAML);
    let config =
        InstanceConfig::load(&path).unwrap_or_else(|err| panic!("config should load: {err}"));
    let base = path.parent().unwrap_or_else(|| panic!("config path has a parent"));
    assert_eq!(config.ssh_directory_path, base.join("keys"));
    assert_eq!(config.join_metadata_path, base.join("state/join.json"));
}

#[test]
fn load_keeps_absolute_paths() {
    let (_dir, path) = write_config(AGENT_JSON);
    let config =
        InstanceConfig::load(&path).unwrap_or_else(|err| panic!("config should load: {err}"));
    assert_eq!(config.ssh_directory_path, Utf8PathBuf::from("/var/keys"));
    assert_eq!(config.join_metadata_path, Utf8PathBuf::from("/var/join.json"));
}

#[test]
fn load_reports_missing_file() {
    let (dir, path) = write_config(SERVER_YAML);
    let missing = path.with_file_name("absent.yaml");
    let err = InstanceConfig::load(&missing).expect_err("missing file should fail");
    assert!(matches!(err, ConfigError::Read { .. }), "got {err:?}");
    drop(dir);
}

#[test]
fn load_validates_after_parsing() {
    let (_dir, path) = write_config(&SERVER_YAML.replace("cpus: 2", "cpus: 0"));
    let err = InstanceConfig::load(&path).expect_err("zero cpus should fail");
    assert_eq!(validation_field(&err), "cpus");
}

fn settings() -> JetskiConfig {
    JetskiConfig {
        multipass_bin: None,
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("ubuntu"),
        kubectl_bin: String::from("kubectl"),
        kube_dir: None,
        poll_interval_ms: 250,
        ip_resolve_attempts: 5,
        ssh_probe_attempts: 6,
        ssh_probe_timeout_secs: 2,
        info_timeout_secs: 3,
        state_wait_info_timeout_secs: 30,
    }
}

#[test]
fn timings_follow_settings() {
    let timings = settings().timings();
    assert_eq!(timings.poll_interval, Duration::from_millis(250));
    assert_eq!(timings.ip_resolve.attempts, 5);
    assert_eq!(timings.ssh_probe.attempts, 6);
    assert_eq!(timings.ssh_probe.interval, Duration::from_millis(250));
    assert_eq!(timings.info_timeout, Duration::from_secs(3));
}

#[rstest]
#[case::ssh_bin("ssh_bin")]
#[case::ssh_user("ssh_user")]
#[case::kubectl_bin("kubectl_bin")]
fn settings_reject_blank_strings(#[case] field: &str) {
    let mut cfg = settings();
    match field {
        "ssh_bin" => cfg.ssh_bin = String::from("  "),
        "ssh_user" => cfg.ssh_user = String::new(),
        _ => cfg.kubectl_bin = String::from(" "),
    }
    let err = cfg.validate().expect_err("blank value should fail");
    let ConfigError::Validation { field: got, message } = err else {
        panic!("expected Validation, got {err:?}");
    };
    assert_eq!(got, field);
    assert!(
        message.contains(&format!("JETSKI_{}", field.to_ascii_uppercase())),
        "message should name the env var: {message}"
    );
}

#[test]
fn settings_reject_zero_budgets() {
    let cfg = JetskiConfig {
        ip_resolve_attempts: 0,
        ..settings()
    };
    let err = cfg.validate().expect_err("zero attempts should fail");
    assert_eq!(validation_field(&err), "ip_resolve_attempts");
}

#[tokio::test]
async fn settings_load_defaults_and_env_overrides() {
    let _guard = EnvGuard::set_vars(&[
        ("JETSKI_SSH_USER", "core"),
        ("JETSKI_IP_RESOLVE_ATTEMPTS", "7"),
    ])
    .await;

    let cfg = JetskiConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("settings should load: {err}"));

    assert_eq!(cfg.ssh_user, "core");
    assert_eq!(cfg.ip_resolve_attempts, 7);
    assert_eq!(cfg.ssh_bin, "ssh");
    assert_eq!(cfg.poll_interval_ms, 1000);
    assert!(cfg.validate().is_ok());
}

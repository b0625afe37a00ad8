//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("jetski");
    cmd.assert()
        .failure()
        .stderr(contains("Usage: jetski <COMMAND>"));
}

#[test]
fn version_prints_package_version() {
    let mut cmd = cargo_bin_cmd!("jetski");
    cmd.arg("version");
    cmd.assert()
        .success()
        .stdout(format!("jetski {}\n", env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_instance_config_fails_with_message() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let missing = dir.path().join("absent.yaml");

    let mut cmd = cargo_bin_cmd!("jetski");
    cmd.env("JETSKI_MULTIPASS_BIN", "multipass");
    cmd.arg("start").arg("--config").arg(&missing);
    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("absent.yaml"));
}

#[test]
fn invalid_instance_config_is_rejected_before_any_command() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let config = dir.path().join("node.yaml");
    std::fs::write(&config, "name: 9lives\nrole: server\n")
        .unwrap_or_else(|err| panic!("write config: {err}"));

    let mut cmd = cargo_bin_cmd!("jetski");
    cmd.env("JETSKI_MULTIPASS_BIN", "/nonexistent/multipass");
    cmd.arg("create").arg("--config").arg(&config);
    cmd.assert().failure().code(1).stderr(contains("configuration error"));
}

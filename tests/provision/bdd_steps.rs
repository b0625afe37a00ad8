//! BDD step definitions for provisioning workflows.

use std::time::Duration;

use jetski::cloud_init;
use jetski::join::{self, JoinError};
use jetski::provision::ProvisionError;
use jetski::test_support::{Reply, info_json};
use rstest_bdd_macros::{given, then, when};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{K3S_YAML, ProvisionWorld, RUNTIME, parse_ip};

fn script_node(world: &ProvisionWorld, name: &str, ip: &str) {
    world.host.always(
        format!("multipass info {name}"),
        Reply::success(info_json(name, "Running", &[ip])),
    );
}

#[given("a scripted host where \"{name}\" boots at \"{ip}\" with node token \"{token}\"")]
fn scripted_host(provision_world: &ProvisionWorld, name: String, ip: String, token: String) {
    let host = &provision_world.host;
    host.always(
        "multipass launch",
        Reply::streaming(["Launching", "Waiting for initialization"], Duration::from_millis(5)),
    );
    host.always(
        "tail -F",
        Reply::streaming(["Cloud-init finished"], Duration::from_millis(1)).following(),
    );
    host.always("node-token", Reply::success(format!("{token}\n")));
    host.always("k3s.yaml", Reply::success(K3S_YAML));
    host.always("kubectl config view", Reply::success("merged: true\n"));
    script_node(provision_world, &name, &ip);
}

#[given("the host boots \"{name}\" at \"{ip}\"")]
fn host_boots(provision_world: &ProvisionWorld, name: String, ip: String) {
    script_node(provision_world, &name, &ip);
}

#[when("I create the bootstrap server \"{name}\"")]
fn create_server(provision_world: &ProvisionWorld, name: String) {
    create(provision_world, &name);
}

#[when("I create the agent \"{name}\"")]
fn create_agent(provision_world: &ProvisionWorld, name: String) {
    create(provision_world, &name);
}

fn create(world: &ProvisionWorld, name: &str) {
    let instance = world.instance(name);
    let provisioner = world.provisioner();
    let outcome = RUNTIME.block_on(async {
        provisioner
            .create(&instance, &CancellationToken::new())
            .await
            .map(drop)
    });
    world.record(outcome);
}

#[when("I stop the server \"{name}\"")]
fn stop_server(provision_world: &ProvisionWorld, name: String) {
    let instance = provision_world.instance(&name);
    let provisioner = provision_world.provisioner();
    let outcome =
        RUNTIME.block_on(async { provisioner.stop(&instance, &CancellationToken::new()).await });
    provision_world.record(outcome);
}

#[then("the create succeeds")]
fn create_succeeds(provision_world: &ProvisionWorld) {
    operation_succeeds(provision_world);
}

#[then("the operation succeeds")]
fn operation_succeeds(provision_world: &ProvisionWorld) {
    match provision_world.outcome.borrow().as_ref() {
        Some(Ok(())) => {}
        Some(Err(err)) => panic!("expected success, got: {err}"),
        None => panic!("no operation was run"),
    }
}

#[then("the create fails because join metadata is missing")]
fn create_fails_missing_join(provision_world: &ProvisionWorld) {
    let outcome = provision_world.outcome.borrow();
    let Some(Err(ProvisionError::Join(JoinError::Missing { path }))) = outcome.as_ref() else {
        panic!("expected a missing join metadata failure, got {outcome:?}");
    };
    assert_eq!(*path, provision_world.join_path().to_string());
}

#[then("no instance was launched")]
fn nothing_launched(provision_world: &ProvisionWorld) {
    assert_eq!(provision_world.host.count("multipass launch"), 0);
}

#[then("the join metadata holds url \"{url}\" and token \"{token}\"")]
fn join_metadata_holds(provision_world: &ProvisionWorld, url: String, token: String) {
    let metadata = join::read(&provision_world.join_path())
        .unwrap_or_else(|err| panic!("join metadata should be readable: {err}"));
    assert_eq!(metadata.url, url);
    assert_eq!(metadata.token, token);
}

#[then("the cluster routes point at \"{ip}\"")]
fn routes_point_at(provision_world: &ProvisionWorld, ip: String) {
    let gateway = parse_ip(&ip);
    for cidr in ["10.42.0.0/16", "10.43.0.0/16"] {
        let command = format!("sudo /sbin/route add -net {cidr} {gateway}");
        assert_eq!(
            provision_world.host.count(&command),
            1,
            "expected one `{command}`"
        );
    }
}

#[then("the agent install command joins \"{url}\" with token \"{token}\"")]
fn agent_joins(provision_world: &ProvisionWorld, url: String, token: String) {
    let agent = provision_world.instance("bravo");
    let metadata = join::read(&agent.join_metadata_path)
        .unwrap_or_else(|err| panic!("agent should see join metadata: {err}"));
    let install = cloud_init::install_command(&agent, Some(&metadata))
        .unwrap_or_else(|err| panic!("install command should render: {err}"));

    assert!(install.contains(&format!("K3S_URL='{url}'")), "install: {install}");
    assert!(install.contains(&format!("K3S_TOKEN='{token}'")), "install: {install}");
    assert!(install.ends_with("sh -s - agent"), "install: {install}");
    assert_eq!(provision_world.host.count("launch -v -c 1 -m 2G -d 10G -n bravo"), 1);
    assert_eq!(
        provision_world.host.count("node-token"),
        1,
        "only the bootstrap server publishes a token"
    );
}

#[then("routes were removed before \"{name}\" was stopped")]
fn routes_removed_before_stop(provision_world: &ProvisionWorld, name: String) {
    let commands = provision_world.host.commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|command| command.contains(needle))
            .unwrap_or_else(|| panic!("no command containing {needle:?}"))
    };
    assert!(position("route delete -net 10.42.0.0/16") < position(&format!("multipass stop {name}")));
    assert!(position("k3s-killall.sh") < position(&format!("multipass stop {name}")));
}

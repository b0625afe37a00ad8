//! BDD scenarios for provisioning workflows.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionWorld, provision_world};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Agent joins the cluster published by the bootstrap server"
)]
fn scenario_agent_joins_bootstrap(provision_world: ProvisionWorld) {
    drop(provision_world);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Agent creation without join metadata launches nothing"
)]
fn scenario_agent_without_join(provision_world: ProvisionWorld) {
    drop(provision_world);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Stopping a server removes its routes before halting"
)]
fn scenario_stop_server(provision_world: ProvisionWorld) {
    drop(provision_world);
}

//! BDD scenarios for fleet provisioning.

use rstest_bdd_macros::scenario;

use super::test_helpers::{FleetContext, fleet_context};

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Install every node and name them in order"
)]
fn scenario_fleet_ready(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Tear the whole fleet down when one node fails"
)]
fn scenario_partial_failure(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Reuse a fleet that already exists"
)]
fn scenario_reuse_fleet(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Tear down only the nodes of the fleet"
)]
fn scenario_teardown(fleet_context: FleetContext) {
    let _ = fleet_context;
}

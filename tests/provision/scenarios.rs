//! BDD scenarios for single-node provisioning.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContext, provision_context};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Stage and bootstrap a node over scp"
)]
fn scenario_stage_over_scp(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Stage and bootstrap a node over sftp"
)]
fn scenario_stage_over_sftp(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Skip unchanged files on a second sftp upload"
)]
fn scenario_incremental_sftp(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Clear stale remote files before staging"
)]
fn scenario_clear_remote_dir(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Terminate a node whose bootstrap fails"
)]
fn scenario_failing_bootstrap(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Reject a missing payload before copying anything"
)]
fn scenario_missing_payload(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Confirm a node that starts after two seconds"
)]
fn scenario_node_ready_after_two_seconds(provision_context: ProvisionContext) {
    let _ = provision_context;
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Time out a node that never starts"
)]
fn scenario_node_never_starts(provision_context: ProvisionContext) {
    let _ = provision_context;
}

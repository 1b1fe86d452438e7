//! BDD scenarios for deduplicated scale-in.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ScaleInContext, scale_in_context};

#[scenario(
    path = "tests/features/scale_in.feature",
    name = "Stop each node of a burst once"
)]
fn scenario_burst(scale_in_context: ScaleInContext) {
    let _ = scale_in_context;
}

#[scenario(
    path = "tests/features/scale_in.feature",
    name = "Suppress a repeated request within the window"
)]
fn scenario_within_window(scale_in_context: ScaleInContext) {
    let _ = scale_in_context;
}

#[scenario(
    path = "tests/features/scale_in.feature",
    name = "Forward a repeated request after the window"
)]
fn scenario_after_window(scale_in_context: ScaleInContext) {
    let _ = scale_in_context;
}

#[scenario(
    path = "tests/features/scale_in.feature",
    name = "Report an unknown address as not stopped"
)]
fn scenario_unknown_address(scale_in_context: ScaleInContext) {
    let _ = scale_in_context;
}

//! Shared fixtures for fleet scenarios.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use rstest::fixture;
use tokio::runtime::Runtime;

use nodewright::test_support::FakeProvider;
use nodewright::{FleetProvisioner, NodeDescriptor, ProvisionError};

use crate::loopback::LoopbackRunner;
use crate::rig::Rig;

pub type LoopbackFleet = FleetProvisioner<FakeProvider, LoopbackRunner>;

#[derive(Clone)]
pub struct FleetContext {
    pub runtime: Option<Arc<Runtime>>,
    pub rig: Option<Arc<Rig>>,
    pub fleet: Option<Arc<LoopbackFleet>>,
    pub provider: Arc<FakeProvider>,
    pub outcome: Option<Arc<Result<Vec<NodeDescriptor>, ProvisionError>>>,
    pub torn_down: Option<usize>,
}

#[fixture]
pub fn fleet_context() -> FleetContext {
    FleetContext {
        runtime: None,
        rig: None,
        fleet: None,
        provider: Arc::new(FakeProvider::new()),
        outcome: None,
        torn_down: None,
    }
}

/// Node ids the bootstrap script recorded, in any order.
pub fn bootstrap_log(rig: &Rig) -> BTreeSet<String> {
    fs::read_to_string(rig.staged().join("nodes"))
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Splits a comma separated step argument into its trimmed items.
pub fn items(list: &str) -> Vec<String> {
    list.split(',').map(|item| item.trim().to_owned()).collect()
}

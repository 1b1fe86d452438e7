//! Shared fixtures for scale-in scenarios.

use std::net::IpAddr;
use std::sync::Arc;

use rstest::fixture;
use tokio::runtime::{Builder, Runtime};

use nodewright::ScaleInDeduplicator;
use nodewright::test_support::FakeProvider;

#[derive(Clone)]
pub struct ScaleInContext {
    pub runtime: Option<Arc<Runtime>>,
    pub provider: Arc<FakeProvider>,
    pub dedup: Option<Arc<ScaleInDeduplicator<FakeProvider>>>,
    pub answers: Vec<bool>,
}

#[fixture]
pub fn scale_in_context() -> ScaleInContext {
    ScaleInContext {
        runtime: None,
        provider: Arc::new(FakeProvider::new()),
        dedup: None,
        answers: Vec::new(),
    }
}

/// Single-threaded runtime whose clock only moves when told to or idle.
pub fn paused_runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
}

/// Parses a comma separated list of addresses.
pub fn addresses(list: &str) -> Result<Vec<IpAddr>, std::net::AddrParseError> {
    list.split(',').map(|item| item.trim().parse()).collect()
}

//! Deduplicated stop requests for scale-in.
//!
//! Scale-in signals may arrive several times for the same node in quick
//! succession. [`ScaleInDeduplicator`] forwards the first one to the provider
//! and suppresses repeats for the same address until the dedup window has
//! passed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::provider::CloudProvider;

/// How long a stop request for an address suppresses repeats.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);

/// Registry size above which expired entries are purged on insert.
pub const DEFAULT_PURGE_THRESHOLD: usize = 256;

/// Addresses with a recent stop request, keyed to the time of that request.
#[derive(Debug)]
pub struct StoppingMachinesRegistry {
    entries: Mutex<HashMap<IpAddr, Instant>>,
    window: Duration,
    purge_threshold: usize,
}

impl Default for StoppingMachinesRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl StoppingMachinesRegistry {
    /// Creates an empty registry suppressing repeats for `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
        }
    }

    /// Replaces the size above which expired entries are purged.
    #[must_use]
    pub const fn with_purge_threshold(mut self, threshold: usize) -> Self {
        self.purge_threshold = threshold;
        self
    }

    /// Dedup window in use.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Records a stop request for `address` unless a younger one exists.
    ///
    /// Returns `true` when the caller now owns the stop for this window.
    /// Check and insert happen under one lock.
    pub fn try_claim(&self, address: IpAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(requested_at) = entries.get(&address)
            && now.saturating_duration_since(*requested_at) < self.window
        {
            return false;
        }
        if entries.len() >= self.purge_threshold {
            let window = self.window;
            entries.retain(|_, requested_at| now.saturating_duration_since(*requested_at) < window);
        }
        entries.insert(address, now);
        true
    }

    /// Forgets the request for `address`, letting the next one through.
    pub fn release(&self, address: IpAddr) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }

    /// Number of tracked addresses, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` when no address is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards stop requests to the provider at most once per address and
/// window.
pub struct ScaleInDeduplicator<P: CloudProvider> {
    provider: Arc<P>,
    registry: StoppingMachinesRegistry,
}

impl<P: CloudProvider> std::fmt::Debug for ScaleInDeduplicator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleInDeduplicator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<P: CloudProvider> ScaleInDeduplicator<P> {
    /// Creates a deduplicator with the default two minute window.
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self::with_registry(provider, StoppingMachinesRegistry::default())
    }

    /// Creates a deduplicator around an explicit registry.
    #[must_use]
    pub const fn with_registry(provider: Arc<P>, registry: StoppingMachinesRegistry) -> Self {
        Self { provider, registry }
    }

    /// Registry tracking recent requests.
    #[must_use]
    pub const fn registry(&self) -> &StoppingMachinesRegistry {
        &self.registry
    }

    /// Requests termination of the node at `address`.
    ///
    /// Returns `Ok(false)` without contacting the provider when a request for
    /// the same address was made within the window; otherwise returns the
    /// provider's answer.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Provider`] when the provider call fails. The
    /// claim is released in that case so a retry is not suppressed.
    pub async fn request_stop(&self, address: IpAddr) -> Result<bool, ProvisionError> {
        if !self.registry.try_claim(address) {
            debug!(%address, "stop already requested within the dedup window");
            return Ok(false);
        }
        match self.provider.terminate_by_address(address).await {
            Ok(stopped) => {
                info!(%address, stopped, "stop request dispatched");
                Ok(stopped)
            }
            Err(err) => {
                warn!(%address, error = %err, "stop request failed");
                self.registry.release(address);
                Err(ProvisionError::provider("terminate by address", &err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;
    use crate::provider::NodeStatus;
    use crate::test_support::FakeProvider;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_within_the_window_are_suppressed() {
        let provider = FakeProvider::new();
        provider.insert_existing("web0", NodeStatus::Running);
        let dedup = ScaleInDeduplicator::new(Arc::new(provider.clone()));
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert!(dedup.request_stop(loopback).await.expect("first stop"));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!dedup.request_stop(loopback).await.expect("repeat"));

        assert_eq!(provider.terminated_addresses(), vec![loopback]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_lets_a_new_request_through() {
        let provider = FakeProvider::new();
        let dedup = ScaleInDeduplicator::new(Arc::new(provider.clone()));
        let target = addr(7);

        assert!(!dedup.request_stop(target).await.expect("no such node"));
        tokio::time::advance(DEFAULT_DEDUP_WINDOW).await;
        assert!(!dedup.request_stop(target).await.expect("second call"));

        assert_eq!(provider.terminated_addresses(), vec![target, target]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_reach_the_provider_once() {
        let provider = FakeProvider::new();
        let dedup = Arc::new(ScaleInDeduplicator::new(Arc::new(provider.clone())));
        let target = addr(9);

        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let dedup = Arc::clone(&dedup);
            calls.spawn(async move { dedup.request_stop(target).await });
        }
        while let Some(joined) = calls.join_next().await {
            joined.expect("task").expect("request");
        }

        assert_eq!(provider.terminated_addresses().len(), 1);
    }

    #[rstest]
    #[case(Duration::from_secs(119), false)]
    #[case(Duration::from_secs(120), true)]
    #[tokio::test(start_paused = true)]
    async fn claim_expires_exactly_at_the_window(#[case] wait: Duration, #[case] claimable: bool) {
        let registry = StoppingMachinesRegistry::default();
        assert!(registry.try_claim(addr(1)));
        tokio::time::advance(wait).await;
        assert_eq!(registry.try_claim(addr(1)), claimable);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_past_the_threshold() {
        let registry = StoppingMachinesRegistry::new(Duration::from_secs(10)).with_purge_threshold(3);
        for last in 1..=3 {
            assert!(registry.try_claim(addr(last)));
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(registry.try_claim(addr(4)));

        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_does_not_suppress_a_retry() {
        let provider = FakeProvider::new().failing_terminations();
        let dedup = ScaleInDeduplicator::new(Arc::new(provider.clone()));
        let target = addr(3);

        assert!(dedup.request_stop(target).await.is_err());
        assert!(dedup.registry().is_empty());
        assert!(dedup.request_stop(target).await.is_err());
        assert_eq!(provider.terminated_addresses().len(), 2);
    }
}

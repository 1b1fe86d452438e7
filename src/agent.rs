//! Management agent registration signals.
//!
//! The installer's last step waits until the agent running on a node has
//! announced itself. [`AgentRegistry`] is fed by the management side in
//! process; [`PortProbeSignal`] treats a successful TCP connect to the agent
//! port as the announcement.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::deadline::Deadline;
use crate::installer::tcp_reachable;

/// Future returned by [`AgentSignal::wait_for_agent`].
pub type SignalFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Event source that fires once an agent registered from an address.
pub trait AgentSignal: Send + Sync {
    /// Waits up to `timeout` for the agent at `address`; returns `false` on
    /// timeout.
    fn wait_for_agent(&self, address: IpAddr, timeout: Duration) -> SignalFuture<'_>;
}

/// In-process registry of agent addresses.
#[derive(Clone, Debug)]
pub struct AgentRegistry {
    registered: Arc<watch::Sender<HashSet<IpAddr>>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(HashSet::new());
        Self {
            registered: Arc::new(sender),
        }
    }

    /// Records that the agent at `address` is up and wakes its waiters.
    pub fn register(&self, address: IpAddr) {
        self.registered.send_modify(|set| {
            set.insert(address);
        });
        debug!(%address, "agent registered");
    }

    /// Forgets `address`; returns `true` when it was registered.
    pub fn deregister(&self, address: IpAddr) -> bool {
        let mut removed = false;
        self.registered.send_modify(|set| removed = set.remove(&address));
        removed
    }

    /// Returns `true` when `address` is currently registered.
    #[must_use]
    pub fn is_registered(&self, address: IpAddr) -> bool {
        self.registered.borrow().contains(&address)
    }
}

impl AgentSignal for AgentRegistry {
    fn wait_for_agent(&self, address: IpAddr, timeout: Duration) -> SignalFuture<'_> {
        let mut receiver = self.registered.subscribe();
        Box::pin(async move {
            let outcome =
                tokio::time::timeout(timeout, receiver.wait_for(|set| set.contains(&address))).await;
            matches!(outcome, Ok(Ok(_)))
        })
    }
}

/// Treats a reachable agent port as a registered agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortProbeSignal {
    /// Agent port.
    pub port: u16,
    /// Pause between probes.
    pub poll_interval: Duration,
    /// Upper bound on one connection attempt.
    pub connect_timeout: Duration,
}

impl PortProbeSignal {
    /// Probes `port` once per second.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl AgentSignal for PortProbeSignal {
    fn wait_for_agent(&self, address: IpAddr, timeout: Duration) -> SignalFuture<'_> {
        Box::pin(async move {
            let deadline = Deadline::after(timeout);
            let target = SocketAddr::new(address, self.port);
            loop {
                let Some(budget) = deadline.cap(self.connect_timeout) else {
                    return false;
                };
                if tcp_reachable(target, budget).await {
                    return true;
                }
                debug!(%target, "agent port not reachable yet");
                if !deadline.sleep(self.poll_interval).await {
                    return false;
                }
            }
        })
    }
}

//! Cloud provider abstraction consumed by the provisioning core.
//!
//! Adapters treat every call as a fallible remote operation with no implicit
//! retry; the core bounds them by its deadline.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use crate::node::{NodeDescriptor, Secret};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Predicate used by [`CloudProvider::list_nodes`].
pub type NodeFilter = dyn Fn(&NodeSnapshot) -> bool + Send + Sync;

/// Handle returned once the provider acknowledged a creation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeHandle {
    /// Provider identifier.
    pub id: String,
    /// Node name.
    pub name: String,
}

/// Lifecycle state reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// Still starting.
    Pending,
    /// Active and usable.
    Running,
    /// Stopped or deleted.
    Terminated,
    /// The provider gave up on the node.
    Error,
    /// Any state the adapter could not map.
    Unknown(String),
}

impl NodeStatus {
    /// Pending or running.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Terminated => f.write_str("terminated"),
            Self::Error => f.write_str("error"),
            Self::Unknown(state) => write!(f, "unknown ({state})"),
        }
    }
}

/// Point-in-time view of a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSnapshot {
    /// Provider identifier.
    pub id: String,
    /// Node name.
    pub name: String,
    /// Lifecycle state.
    pub status: NodeStatus,
    /// Private address, once assigned.
    pub private_address: Option<IpAddr>,
    /// Public address, once assigned.
    pub public_address: Option<IpAddr>,
    /// Credential issued with the node, if any.
    pub credential: Option<Secret>,
    /// The node image already runs the management agent.
    pub agent_preinstalled: bool,
}

impl NodeSnapshot {
    /// Copies addresses and credential into `descriptor`.
    pub fn apply_to(&self, descriptor: &mut NodeDescriptor) {
        if self.private_address.is_some() {
            descriptor.private_address = self.private_address;
        }
        if self.public_address.is_some() {
            descriptor.public_address = self.public_address;
        }
        if self.credential.is_some() {
            descriptor.raw_credential.clone_from(&self.credential);
        }
    }

    /// Descriptor for this node.
    #[must_use]
    pub fn to_descriptor(&self) -> NodeDescriptor {
        let mut descriptor = NodeDescriptor::new(self.id.clone(), self.name.clone());
        self.apply_to(&mut descriptor);
        descriptor
    }

    /// Returns `true` when either address equals `address`.
    #[must_use]
    pub fn has_address(&self, address: IpAddr) -> bool {
        self.private_address == Some(address) || self.public_address == Some(address)
    }
}

/// Filter selecting live nodes whose name starts with `prefix`.
#[must_use]
pub fn live_with_prefix(prefix: &str) -> Box<NodeFilter> {
    let owned = prefix.to_owned();
    Box::new(move |node: &NodeSnapshot| node.status.is_live() && node.name.starts_with(&owned))
}

/// Filter selecting live nodes called exactly `name`.
#[must_use]
pub fn live_named(name: &str) -> Box<NodeFilter> {
    let owned = name.to_owned();
    Box::new(move |node: &NodeSnapshot| node.status.is_live() && node.name == owned)
}

/// Minimal interface implemented by cloud adapters.
pub trait CloudProvider: Send + Sync {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests a new node called `name`.
    fn create_node<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, NodeHandle, Self::Error>;

    /// Reports the current state of node `id`.
    fn describe_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, NodeSnapshot, Self::Error>;

    /// Lists nodes accepted by `filter`.
    fn list_nodes<'a>(
        &'a self,
        filter: &'a NodeFilter,
    ) -> ProviderFuture<'a, Vec<NodeSnapshot>, Self::Error>;

    /// Terminates node `id`.
    fn terminate_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Terminates the node owning `address`; returns `false` when no node
    /// matched.
    fn terminate_by_address(&self, address: IpAddr) -> ProviderFuture<'_, bool, Self::Error>;
}

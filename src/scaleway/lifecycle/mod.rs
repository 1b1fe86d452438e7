//! Instance lifecycle helpers for the Scaleway provider.

use std::net::IpAddr;
use std::str::FromStr;

mod create;
mod image;

use crate::provider::{NodeSnapshot, NodeStatus};
use crate::scaleway::types::{Action, InstanceId, InstanceState};

/// Tag carried by every node this crate creates.
pub(crate) const NODE_TAG: &str = "nodewright";

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InstanceSnapshot {
    pub(crate) id: InstanceId,
    pub(crate) name: String,
    pub(crate) state: InstanceState,
    pub(crate) allowed_actions: Vec<Action>,
    pub(crate) public_ip: Option<String>,
    pub(crate) private_ip: Option<String>,
    pub(crate) tags: Vec<String>,
}

impl From<scaleway_rs::ScalewayInstance> for InstanceSnapshot {
    fn from(server: scaleway_rs::ScalewayInstance) -> Self {
        Self {
            id: server.id.into(),
            name: server.name,
            state: server.state.into(),
            allowed_actions: server
                .allowed_actions
                .into_iter()
                .map(Action::from)
                .collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
            private_ip: server.private_ip,
            tags: server.tags,
        }
    }
}

impl InstanceSnapshot {
    pub(crate) fn is_managed(&self) -> bool {
        self.tags.iter().any(|tag| tag == NODE_TAG)
    }

    /// Maps Scaleway server states onto the provider-neutral lifecycle.
    ///
    /// A freshly created server reports `stopped` until the power-on action
    /// is picked up, so it counts as pending.
    pub(crate) fn status(&self) -> NodeStatus {
        match self.state.as_str() {
            "starting" | "stopped" | "stopped in place" => NodeStatus::Pending,
            "running" => NodeStatus::Running,
            "stopping" => NodeStatus::Terminated,
            "locked" => NodeStatus::Error,
            other => NodeStatus::Unknown(other.to_owned()),
        }
    }

    pub(crate) fn has_address(&self, address: IpAddr) -> bool {
        parse_ip(self.public_ip.as_deref()) == Some(address)
            || parse_ip(self.private_ip.as_deref()) == Some(address)
    }

    pub(crate) fn to_node_snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.as_str().to_owned(),
            name: self.name.clone(),
            status: self.status(),
            private_address: parse_ip(self.private_ip.as_deref()),
            public_address: parse_ip(self.public_ip.as_deref()),
            credential: None,
            agent_preinstalled: false,
        }
    }
}

fn parse_ip(raw: Option<&str>) -> Option<IpAddr> {
    raw.and_then(|ip| IpAddr::from_str(ip).ok())
}

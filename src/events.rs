//! Provisioning events published while workflows run.

use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, info, warn};

use crate::installer::InstallerState;

/// Something observable happened during provisioning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisioningEvent {
    /// A node was requested from the provider.
    NodeRequested {
        /// Requested name.
        name: String,
    },
    /// The provider acknowledged the request.
    NodeAllocated {
        /// Provider identifier.
        id: String,
        /// Node name.
        name: String,
    },
    /// The node reported its addresses.
    AddressesAssigned {
        /// Provider identifier.
        id: String,
        /// Private address.
        private_address: Option<IpAddr>,
        /// Public address.
        public_address: Option<IpAddr>,
    },
    /// The installer moved to a new state.
    InstallerStateChanged {
        /// Address being installed.
        address: IpAddr,
        /// New state.
        state: InstallerState,
    },
    /// The node is installed and its agent confirmed.
    NodeReady {
        /// Provider identifier.
        id: String,
        /// Node name.
        name: String,
    },
    /// A single-node workflow failed.
    NodeFailed {
        /// Node name, when one was chosen.
        name: Option<String>,
        /// Failing step.
        step: String,
        /// Error text.
        message: String,
    },
    /// A fleet workflow started.
    FleetStarting {
        /// Correlation id.
        fleet_id: String,
        /// Nodes requested.
        count: usize,
    },
    /// Every fleet node is ready.
    FleetReady {
        /// Correlation id.
        fleet_id: String,
        /// Nodes ready.
        count: usize,
    },
}

/// Receives provisioning events. Implementations must not block.
pub trait ProvisioningListener: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &ProvisioningEvent);
}

/// Delivers `event` to `listener`, containing any panic it raises.
pub fn publish(listener: &dyn ProvisioningListener, event: &ProvisioningEvent) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
        warn!(?event, "provisioning listener panicked; event dropped");
    }
}

/// Listener that logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingListener;

impl ProvisioningListener for TracingListener {
    fn on_event(&self, event: &ProvisioningEvent) {
        match event {
            ProvisioningEvent::NodeRequested { name } => info!(%name, "node requested"),
            ProvisioningEvent::NodeAllocated { id, name } => {
                info!(node_id = %id, %name, "node allocated");
            }
            ProvisioningEvent::AddressesAssigned {
                id,
                private_address,
                public_address,
            } => info!(
                node_id = %id,
                private = ?private_address,
                public = ?public_address,
                "node addresses assigned"
            ),
            ProvisioningEvent::InstallerStateChanged { address, state } => {
                info!(%address, %state, "installer state changed");
            }
            ProvisioningEvent::NodeReady { id, name } => info!(node_id = %id, %name, "node ready"),
            ProvisioningEvent::NodeFailed {
                name,
                step,
                message,
            } => error!(name = ?name, %step, error = %message, "node provisioning failed"),
            ProvisioningEvent::FleetStarting { fleet_id, count } => {
                info!(%fleet_id, count, "fleet provisioning started");
            }
            ProvisioningEvent::FleetReady { fleet_id, count } => {
                info!(%fleet_id, count, "fleet ready");
            }
        }
    }
}

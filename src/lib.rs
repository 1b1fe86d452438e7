//! Core library for the Nodewright node provisioner.
//!
//! The crate requests compute nodes from a cloud provider, waits for them to
//! run, stages an installation payload over one of three file transports,
//! bootstraps a management agent, and cleans up whenever a step fails. Every
//! workflow is bounded by one absolute [`Deadline`] computed at its root.
//!
//! Entry points:
//!
//! - [`NodeProvisioner::provision_node`] for a single node;
//! - [`FleetProvisioner::provision_fleet`] for N nodes that succeed or fail
//!   together;
//! - [`ScaleInDeduplicator::request_stop`] for deduplicated scale-in.

pub mod agent;
pub mod cleanup;
pub mod config;
pub mod credentials;
pub mod deadline;
pub mod error;
pub mod events;
pub mod fleet;
pub mod installation;
pub mod installer;
pub mod logging;
pub mod node;
pub mod provider;
pub mod provisioner;
pub mod remote;
pub mod scale_in;
pub mod scaleway;
pub mod test_support;
pub mod transport;

pub use agent::{AgentRegistry, AgentSignal, PortProbeSignal, SignalFuture};
pub use config::{ConfigError, ProvisioningConfig, ScalewayConfig};
pub use deadline::Deadline;
pub use error::{NodeFailure, ProvisionError, Step};
pub use events::{ProvisioningEvent, ProvisioningListener, TracingListener};
pub use fleet::FleetProvisioner;
pub use installation::{ConnectionSettings, InstallationSpec, InstallationSpecBuilder, TransferKind};
pub use installer::{InstallerState, InstallerTimings, RemoteInstaller};
pub use logging::{LogFormat, LoggerError, LoggingConfig};
pub use node::{NodeDescriptor, RemoteCredential, Secret};
pub use provider::{
    CloudProvider, NodeFilter, NodeHandle, NodeSnapshot, NodeStatus, ProviderFuture,
};
pub use provisioner::{NameAllocator, NodeProvisioner};
pub use remote::{
    CommandError, CommandOutput, CommandRunner, Invocation, ProcessCommandRunner,
    RemoteAccessConfig, RemoteExecutor,
};
pub use scale_in::{ScaleInDeduplicator, StoppingMachinesRegistry};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use transport::{FileTransport, Transport, TransferReport};

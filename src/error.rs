//! Error taxonomy shared by every provisioning workflow.
//!
//! [`ProvisionError`] names *why* something failed. [`NodeFailure`] adds
//! *where* it failed: the step that was running and the (possibly partially
//! populated) descriptor of the node involved, so callers can still clean up.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::installation::TransferKind;
use crate::installer::InstallerState;
use crate::node::NodeDescriptor;

/// Failure kinds raised by the provisioning core.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The cloud provider rejected node creation, or reported the node in a
    /// terminal state while it was starting.
    #[error("provisioning of node {name} failed: {reason}")]
    ProvisioningFailed {
        /// Node name (or id once known).
        name: String,
        /// Provider supplied reason.
        reason: String,
    },
    /// The node never reached the running state before the deadline.
    #[error("node {node_id} did not reach the running state before the deadline")]
    StartupTimeout {
        /// Provider identifier of the node.
        node_id: String,
    },
    /// TCP reachability was never established before the deadline.
    #[error("host {target} never became reachable on port {port}")]
    HostUnreachable {
        /// Address (or node id when no address is known) being probed.
        target: String,
        /// Port being probed.
        port: u16,
    },
    /// Neither the node nor the installation spec supplied a credential.
    #[error("no credentials available: the node issued none and no key file or password is configured")]
    MissingCredentials,
    /// A transport session could not be established.
    #[error("{transport} transport setup failed: {message}")]
    TransportSetupFailed {
        /// Transport being initialised.
        transport: TransferKind,
        /// Diagnostic detail.
        message: String,
    },
    /// A step began, or was still running, after the deadline elapsed.
    #[error("deadline exceeded during {step}")]
    TimeoutExceeded {
        /// Step that ran out of time.
        step: String,
    },
    /// A remote command exited non-zero or without an exit status.
    #[error("remote command `{command}` failed with status {status_text}: {output}")]
    RemoteCommandFailed {
        /// Command line that was executed.
        command: String,
        /// Exit status, when the command terminated normally.
        status: Option<i32>,
        /// Human readable status.
        status_text: String,
        /// Captured stdout and stderr.
        output: String,
    },
    /// The management agent never registered from the node's address.
    #[error("management agent on {address} did not register before the deadline")]
    AgentNotStarted {
        /// Address the agent was expected to register from.
        address: IpAddr,
    },
    /// Every node name in the bounded range is already taken.
    #[error("all {capacity} node names with prefix '{prefix}' are in use")]
    NameSpaceExhausted {
        /// Name prefix.
        prefix: String,
        /// Size of the counter range.
        capacity: u32,
    },
    /// The configured transport kind is not one of the supported values.
    #[error("unsupported transport kind '{kind}' (expected scp, sftp or share)")]
    UnsupportedTransport {
        /// Value that failed to parse.
        kind: String,
    },
    /// One or more nodes of a fleet failed; every successful node was
    /// terminated.
    #[error("{failed} of {requested} fleet nodes failed; first failure: {first}")]
    PartialFleetFailure {
        /// Number of failed nodes.
        failed: usize,
        /// Number of nodes requested.
        requested: usize,
        /// First failure observed.
        #[source]
        first: Box<NodeFailure>,
    },
    /// Any other cloud provider failure.
    #[error("cloud provider {operation} failed: {message}")]
    Provider {
        /// Adapter operation that failed.
        operation: String,
        /// Provider supplied message.
        message: String,
    },
    /// A temporary credential file could not be written.
    #[error("failed to write temporary credential file: {source}")]
    CredentialFile {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The local payload tree could not be read.
    #[error("cannot read local payload {path}: {message}")]
    LocalPayload {
        /// Path being read.
        path: String,
        /// Diagnostic detail.
        message: String,
    },
    /// The installation spec failed validation.
    #[error("invalid installation spec: {field} {reason}")]
    InvalidSpec {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Nodes carrying the fleet prefix exist, but not exactly as many as
    /// requested.
    #[error("found {found} existing nodes with prefix '{prefix}' but {expected} were requested")]
    ExistingFleetMismatch {
        /// Fleet name prefix.
        prefix: String,
        /// Nodes found.
        found: usize,
        /// Nodes requested.
        expected: usize,
    },
    /// A local helper process could not be spawned.
    #[error(transparent)]
    Command(#[from] crate::remote::CommandError),
}

impl ProvisionError {
    /// Wraps an adapter error raised by `operation`.
    #[must_use]
    pub fn provider(operation: &str, err: &impl std::error::Error) -> Self {
        Self::Provider {
            operation: operation.to_owned(),
            message: err.to_string(),
        }
    }

    /// Builds a [`ProvisionError::TimeoutExceeded`] for `step`.
    #[must_use]
    pub fn timeout(step: Step) -> Self {
        Self::TimeoutExceeded {
            step: step.to_string(),
        }
    }

    /// Returns `true` for deadline related failures.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::TimeoutExceeded { .. } | Self::StartupTimeout { .. }
        )
    }
}

/// Workflow step in which a failure occurred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Choosing a free node name.
    AllocateName,
    /// Asking the provider for a node.
    CreateNode,
    /// Waiting for the provider to report the node as running.
    AwaitRunning,
    /// Turning the node credential into a usable key file or password.
    MaterializeCredentials,
    /// Driving the remote installer.
    Install(InstallerState),
    /// Waiting for a fleet worker to report back.
    JoinFleetWorker,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocateName => f.write_str("allocate-name"),
            Self::CreateNode => f.write_str("create-node"),
            Self::AwaitRunning => f.write_str("await-running"),
            Self::MaterializeCredentials => f.write_str("materialize-credentials"),
            Self::Install(state) => write!(f, "install/{state}"),
            Self::JoinFleetWorker => f.write_str("join-fleet-worker"),
        }
    }
}

/// Typed failure of a single-node workflow.
#[derive(Debug, Error)]
#[error("{step} failed for {}: {source}", node_label(.node.as_deref()))]
pub struct NodeFailure {
    /// Descriptor of the node involved; absent when no node was created.
    pub node: Option<Box<NodeDescriptor>>,
    /// Step that failed.
    pub step: Step,
    /// Cause.
    #[source]
    pub source: ProvisionError,
}

impl NodeFailure {
    /// Creates a failure that is not yet tied to a node.
    #[must_use]
    pub const fn new(step: Step, source: ProvisionError) -> Self {
        Self {
            node: None,
            step,
            source,
        }
    }

    /// Attaches the descriptor of the node involved.
    #[must_use]
    pub fn with_node(mut self, node: NodeDescriptor) -> Self {
        self.node = Some(Box::new(node));
        self
    }

    /// Returns the descriptor, if any.
    #[must_use]
    pub fn node(&self) -> Option<&NodeDescriptor> {
        self.node.as_deref()
    }
}

fn node_label(node: Option<&NodeDescriptor>) -> String {
    node.map_or_else(
        || String::from("<no node>"),
        |descriptor| format!("node {} ({})", descriptor.name, descriptor.id),
    )
}

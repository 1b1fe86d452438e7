//! Single-node provisioning: create, await running, install, confirm.
//!
//! Every step after the provider acknowledged the node is compensated on
//! failure: the node is terminated (best effort) before the typed failure is
//! returned. A creation request that times out is followed by a sweep for a
//! live node of the requested name, since the provider may have created it
//! without answering in time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cleanup::CleanupStack;
use crate::credentials;
use crate::deadline::Deadline;
use crate::error::{NodeFailure, ProvisionError, Step};
use crate::events::{ProvisioningEvent, ProvisioningListener, publish};
use crate::installation::InstallationSpec;
use crate::installer::RemoteInstaller;
use crate::node::NodeDescriptor;
use crate::provider::{CloudProvider, NodeSnapshot, NodeStatus, live_named};
use crate::remote::CommandRunner;

mod naming;

pub use naming::{DEFAULT_NAME_CAPACITY, NameAllocator};

/// Default pause between provider status polls.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on the compensating termination call.
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `call` with whatever time remains before `deadline`.
async fn within<T, E>(
    deadline: &Deadline,
    step: Step,
    call: impl Future<Output = Result<T, E>>,
) -> Result<Result<T, E>, ProvisionError> {
    let remaining = deadline.remaining_for(step.to_string().as_str())?;
    tokio::time::timeout(remaining, call)
        .await
        .map_err(|_| ProvisionError::timeout(step))
}

/// Drives one node through its whole lifecycle.
pub struct NodeProvisioner<P: CloudProvider + 'static, R: CommandRunner + 'static> {
    provider: Arc<P>,
    installer: RemoteInstaller<R>,
    listener: Arc<dyn ProvisioningListener>,
    names: Arc<NameAllocator>,
    poll_interval: Duration,
    termination_timeout: Duration,
}

impl<P: CloudProvider + 'static, R: CommandRunner + 'static> Clone for NodeProvisioner<P, R> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            installer: self.installer.clone(),
            listener: Arc::clone(&self.listener),
            names: Arc::clone(&self.names),
            poll_interval: self.poll_interval,
            termination_timeout: self.termination_timeout,
        }
    }
}

impl<P: CloudProvider + 'static, R: CommandRunner + 'static> fmt::Debug for NodeProvisioner<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeProvisioner")
            .field("installer", &self.installer)
            .field("names", &self.names)
            .field("poll_interval", &self.poll_interval)
            .field("termination_timeout", &self.termination_timeout)
            .finish_non_exhaustive()
    }
}

impl<P: CloudProvider + 'static, R: CommandRunner + 'static> NodeProvisioner<P, R> {
    /// Creates a provisioner with default naming and polling.
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        installer: RemoteInstaller<R>,
        listener: Arc<dyn ProvisioningListener>,
    ) -> Self {
        Self {
            provider,
            installer,
            listener,
            names: Arc::new(NameAllocator::default()),
            poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
        }
    }

    /// Replaces the name allocator.
    #[must_use]
    pub fn with_names(mut self, names: NameAllocator) -> Self {
        self.names = Arc::new(names);
        self
    }

    /// Replaces the status poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the bound on compensating terminations.
    #[must_use]
    pub const fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    /// Cloud adapter in use.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Listener receiving provisioning events.
    #[must_use]
    pub fn listener(&self) -> &dyn ProvisioningListener {
        self.listener.as_ref()
    }

    /// Bound on compensating terminations.
    #[must_use]
    pub const fn termination_timeout(&self) -> Duration {
        self.termination_timeout
    }

    /// Provisions one node within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeFailure`] naming the failing step. When a node was
    /// created it has already been terminated and its descriptor is attached.
    pub async fn provision_node(
        &self,
        spec: &InstallationSpec,
        timeout: Duration,
    ) -> Result<NodeDescriptor, NodeFailure> {
        self.provision(spec, &Deadline::after(timeout)).await
    }

    /// Provisions one node with a generated name, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// See [`NodeProvisioner::provision_node`].
    pub async fn provision(
        &self,
        spec: &InstallationSpec,
        deadline: &Deadline,
    ) -> Result<NodeDescriptor, NodeFailure> {
        let name = self
            .allocate_name(spec, deadline)
            .await
            .map_err(|err| self.report(NodeFailure::new(Step::AllocateName, err), None))?;
        self.provision_named(spec, &name, deadline).await
    }

    async fn allocate_name(
        &self,
        spec: &InstallationSpec,
        deadline: &Deadline,
    ) -> Result<String, ProvisionError> {
        spec.validate()?;
        within(
            deadline,
            Step::AllocateName,
            self.names.allocate(self.provider.as_ref(), &spec.name_prefix),
        )
        .await?
    }

    /// Provisions one node called `name`, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// See [`NodeProvisioner::provision_node`].
    pub async fn provision_named(
        &self,
        spec: &InstallationSpec,
        name: &str,
        deadline: &Deadline,
    ) -> Result<NodeDescriptor, NodeFailure> {
        let span = info_span!("provision_node", node_name = %name);
        self.run_lifecycle(spec, name, deadline).instrument(span).await
    }

    async fn run_lifecycle(
        &self,
        spec: &InstallationSpec,
        name: &str,
        deadline: &Deadline,
    ) -> Result<NodeDescriptor, NodeFailure> {
        let mut descriptor = self
            .create(spec, name, deadline)
            .await
            .map_err(|err| self.report(NodeFailure::new(Step::CreateNode, err), Some(name)))?;

        match self.complete(spec, &mut descriptor, deadline).await {
            Ok(()) => {
                publish(
                    self.listener.as_ref(),
                    &ProvisioningEvent::NodeReady {
                        id: descriptor.id.clone(),
                        name: descriptor.name.clone(),
                    },
                );
                Ok(descriptor)
            }
            Err(failure) => {
                self.terminate_quietly(&descriptor).await;
                let failure = failure.with_node(descriptor);
                Err(self.report(failure, Some(name)))
            }
        }
    }

    async fn create(
        &self,
        spec: &InstallationSpec,
        name: &str,
        deadline: &Deadline,
    ) -> Result<NodeDescriptor, ProvisionError> {
        spec.validate()?;
        publish(
            self.listener.as_ref(),
            &ProvisioningEvent::NodeRequested {
                name: name.to_owned(),
            },
        );
        let remaining = deadline.remaining_for(Step::CreateNode.to_string().as_str())?;
        let created = match tokio::time::timeout(remaining, self.provider.create_node(name)).await {
            Ok(created) => created,
            Err(_) => {
                self.sweep_unacknowledged(name).await;
                return Err(ProvisionError::timeout(Step::CreateNode));
            }
        };
        let handle = created.map_err(|err| ProvisionError::ProvisioningFailed {
            name: name.to_owned(),
            reason: err.to_string(),
        })?;
        info!(node_id = %handle.id, name = %handle.name, "node allocated");
        publish(
            self.listener.as_ref(),
            &ProvisioningEvent::NodeAllocated {
                id: handle.id.clone(),
                name: handle.name.clone(),
            },
        );
        Ok(NodeDescriptor::new(handle.id, handle.name))
    }

    async fn complete(
        &self,
        spec: &InstallationSpec,
        descriptor: &mut NodeDescriptor,
        deadline: &Deadline,
    ) -> Result<(), NodeFailure> {
        let snapshot = self
            .await_running(descriptor, deadline)
            .await
            .map_err(|err| NodeFailure::new(Step::AwaitRunning, err))?;

        let mut cleanup = CleanupStack::new();
        let credential = credentials::materialize(
            descriptor.raw_credential.as_ref(),
            &spec.connection,
            &mut cleanup,
        )
        .map_err(|err| NodeFailure::new(Step::MaterializeCredentials, err))?;

        let installed = self
            .installer
            .install(
                spec,
                descriptor,
                credential,
                snapshot.agent_preinstalled,
                deadline,
            )
            .await;
        cleanup.run();
        installed?;

        descriptor.installed = true;
        descriptor.agent_running = true;
        Ok(())
    }

    async fn await_running(
        &self,
        descriptor: &mut NodeDescriptor,
        deadline: &Deadline,
    ) -> Result<NodeSnapshot, ProvisionError> {
        let id = descriptor.id.clone();
        let startup_timeout = || ProvisionError::StartupTimeout {
            node_id: id.clone(),
        };
        let mut announced = (None, None);
        loop {
            let Some(remaining) = deadline.remaining() else {
                return Err(startup_timeout());
            };
            let snapshot = match tokio::time::timeout(remaining, self.provider.describe_node(&id))
                .await
            {
                Err(_) => return Err(startup_timeout()),
                Ok(Err(err)) => return Err(ProvisionError::provider("describe node", &err)),
                Ok(Ok(snapshot)) => snapshot,
            };

            snapshot.apply_to(descriptor);
            let addresses = (descriptor.private_address, descriptor.public_address);
            if addresses != announced && (addresses.0.is_some() || addresses.1.is_some()) {
                announced = addresses;
                info!(
                    node_id = %id,
                    private = ?addresses.0,
                    public = ?addresses.1,
                    "node addresses assigned"
                );
                publish(
                    self.listener.as_ref(),
                    &ProvisioningEvent::AddressesAssigned {
                        id: id.clone(),
                        private_address: addresses.0,
                        public_address: addresses.1,
                    },
                );
            }

            match &snapshot.status {
                NodeStatus::Running => return Ok(snapshot),
                NodeStatus::Pending => debug!(node_id = %id, "node still pending"),
                other => {
                    return Err(ProvisionError::ProvisioningFailed {
                        name: descriptor.name.clone(),
                        reason: format!("provider reported the node as {other}"),
                    });
                }
            }

            if !deadline.sleep(self.poll_interval).await {
                return Err(startup_timeout());
            }
        }
    }

    /// Terminates any live node called `name` left by a creation request
    /// that timed out before the provider acknowledged it.
    async fn sweep_unacknowledged(&self, name: &str) {
        let filter = live_named(name);
        let listing =
            tokio::time::timeout(self.termination_timeout, self.provider.list_nodes(&*filter)).await;
        let nodes = match listing {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(err)) => {
                warn!(node_name = %name, error = %err, "could not list nodes after create timeout");
                return;
            }
            Err(_) => {
                warn!(node_name = %name, "timed out listing nodes after create timeout");
                return;
            }
        };
        for node in &nodes {
            warn!(
                node_id = %node.id,
                node_name = %name,
                "terminating node created after its request timed out"
            );
            self.terminate_quietly(&node.to_descriptor()).await;
        }
    }

    /// Terminates `descriptor`'s node, logging instead of failing.
    pub(crate) async fn terminate_quietly(&self, descriptor: &NodeDescriptor) {
        let call = self.provider.terminate_node(&descriptor.id);
        match tokio::time::timeout(self.termination_timeout, call).await {
            Ok(Ok(())) => info!(node_id = %descriptor.id, "node terminated"),
            Ok(Err(err)) => warn!(
                node_id = %descriptor.id,
                error = %err,
                "failed to terminate node; it may need manual cleanup"
            ),
            Err(_) => warn!(
                node_id = %descriptor.id,
                timeout = ?self.termination_timeout,
                "timed out terminating node; it may need manual cleanup"
            ),
        }
    }

    fn report(&self, failure: NodeFailure, name: Option<&str>) -> NodeFailure {
        error!(step = %failure.step, error = %failure.source, "node provisioning failed");
        publish(
            self.listener.as_ref(),
            &ProvisioningEvent::NodeFailed {
                name: name.map(str::to_owned),
                step: failure.step.to_string(),
                message: failure.source.to_string(),
            },
        );
        failure
    }
}

//! Fleet provisioning: N nodes that succeed or fail together.
//!
//! Workers run on a [`JoinSet`] sized to the fleet, share one deadline, and
//! are collected before any compensation starts. A fleet is never reported
//! as partially successful: when one worker fails, every node that did come
//! up is terminated and [`ProvisionError::PartialFleetFailure`] is returned.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::deadline::{Deadline, saturating_instant};
use crate::error::{NodeFailure, ProvisionError, Step};
use crate::events::{ProvisioningEvent, publish};
use crate::installation::InstallationSpec;
use crate::node::NodeDescriptor;
use crate::provider::{CloudProvider, NodeSnapshot, live_with_prefix};
use crate::provisioner::NodeProvisioner;
use crate::remote::CommandRunner;

/// Extra time workers get past the shared deadline to finish their own
/// compensation before they are aborted.
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(30);

type WorkerOutcome = (usize, Result<NodeDescriptor, NodeFailure>);

/// Outcomes gathered from every worker.
#[derive(Default)]
struct Collected {
    ready: Vec<(usize, NodeDescriptor)>,
    failures: Vec<NodeFailure>,
    aborted: usize,
}

impl Collected {
    fn record(&mut self, joined: Result<WorkerOutcome, JoinError>) {
        match joined {
            Ok((index, Ok(node))) => self.ready.push((index, node)),
            Ok((_, Err(failure))) => self.failures.push(failure),
            Err(err) if err.is_cancelled() => {
                self.aborted += 1;
                self.failures.push(NodeFailure::new(
                    Step::JoinFleetWorker,
                    ProvisionError::timeout(Step::JoinFleetWorker),
                ));
            }
            Err(err) => self.failures.push(NodeFailure::new(
                Step::JoinFleetWorker,
                ProvisionError::Provider {
                    operation: String::from("join fleet worker"),
                    message: err.to_string(),
                },
            )),
        }
    }
}

/// Provisions fleets of nodes named `<prefix><index>`.
pub struct FleetProvisioner<P: CloudProvider + 'static, R: CommandRunner + 'static> {
    nodes: NodeProvisioner<P, R>,
    join_grace: Duration,
}

impl<P: CloudProvider + 'static, R: CommandRunner + 'static> fmt::Debug for FleetProvisioner<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetProvisioner")
            .field("nodes", &self.nodes)
            .field("join_grace", &self.join_grace)
            .finish()
    }
}

impl<P: CloudProvider + 'static, R: CommandRunner + 'static> FleetProvisioner<P, R> {
    /// Wraps a single-node provisioner.
    #[must_use]
    pub const fn new(nodes: NodeProvisioner<P, R>) -> Self {
        Self {
            nodes,
            join_grace: DEFAULT_JOIN_GRACE,
        }
    }

    /// Replaces the join grace period.
    #[must_use]
    pub const fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    /// Provisions `count` nodes within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::PartialFleetFailure`] when any node failed
    /// (after terminating the ones that succeeded),
    /// [`ProvisionError::ExistingFleetMismatch`] when some but not `count`
    /// fleet nodes already exist, and [`ProvisionError::TimeoutExceeded`]
    /// when `timeout` is already exhausted.
    pub async fn provision_fleet(
        &self,
        spec: &InstallationSpec,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<NodeDescriptor>, ProvisionError> {
        self.provision_fleet_until(spec, count, &Deadline::after(timeout))
            .await
    }

    /// Like [`FleetProvisioner::provision_fleet`] with a caller supplied
    /// deadline, which may carry a cancellation token.
    ///
    /// # Errors
    ///
    /// See [`FleetProvisioner::provision_fleet`].
    pub async fn provision_fleet_until(
        &self,
        spec: &InstallationSpec,
        count: usize,
        deadline: &Deadline,
    ) -> Result<Vec<NodeDescriptor>, ProvisionError> {
        if count == 0 {
            return Err(ProvisionError::InvalidSpec {
                field: String::from("count"),
                reason: String::from("a fleet needs at least one node"),
            });
        }
        spec.validate()?;

        if let Some(existing) = self.existing_fleet(spec, count, deadline).await? {
            info!(prefix = %spec.name_prefix, count, "reusing existing fleet");
            return Ok(existing);
        }

        let fleet_id = Uuid::new_v4().to_string();
        let span = info_span!("provision_fleet", %fleet_id, count);
        self.fan_out(spec, count, deadline, &fleet_id)
            .instrument(span)
            .await
    }

    async fn existing_fleet(
        &self,
        spec: &InstallationSpec,
        count: usize,
        deadline: &Deadline,
    ) -> Result<Option<Vec<NodeDescriptor>>, ProvisionError> {
        let remaining = deadline.remaining_for("list-existing-fleet")?;
        let filter = live_with_prefix(&spec.name_prefix);
        let listed = tokio::time::timeout(remaining, self.nodes.provider().list_nodes(&*filter))
            .await
            .map_err(|_| ProvisionError::TimeoutExceeded {
                step: String::from("list-existing-fleet"),
            })?
            .map_err(|err| ProvisionError::provider("list nodes", &err))?;

        if listed.is_empty() {
            return Ok(None);
        }
        if listed.len() != count {
            return Err(ProvisionError::ExistingFleetMismatch {
                prefix: spec.name_prefix.clone(),
                found: listed.len(),
                expected: count,
            });
        }
        let mut nodes = listed
            .iter()
            .map(NodeSnapshot::to_descriptor)
            .map(|mut node| {
                node.installed = true;
                node.agent_running = true;
                node
            })
            .collect::<Vec<_>>();
        nodes.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(Some(nodes))
    }

    async fn fan_out(
        &self,
        spec: &InstallationSpec,
        count: usize,
        deadline: &Deadline,
        fleet_id: &str,
    ) -> Result<Vec<NodeDescriptor>, ProvisionError> {
        publish(
            self.nodes.listener(),
            &ProvisioningEvent::FleetStarting {
                fleet_id: fleet_id.to_owned(),
                count,
            },
        );

        let mut workers = JoinSet::new();
        for index in 1..=count {
            let nodes = self.nodes.clone();
            let worker_spec = spec.clone();
            let worker_deadline = deadline.clone();
            let name = format!("{}{index}", spec.name_prefix);
            workers.spawn(
                async move {
                    let outcome = nodes
                        .provision_named(&worker_spec, &name, &worker_deadline)
                        .await;
                    (index, outcome)
                }
                .in_current_span(),
            );
        }

        let collected = self.collect(workers, deadline).await;
        if collected.failures.is_empty() {
            let mut ready = collected.ready;
            ready.sort_by_key(|(index, _)| *index);
            info!(count, "fleet ready");
            publish(
                self.nodes.listener(),
                &ProvisioningEvent::FleetReady {
                    fleet_id: fleet_id.to_owned(),
                    count,
                },
            );
            return Ok(ready.into_iter().map(|(_, node)| node).collect());
        }

        self.compensate(spec, count, &collected).await;
        let failed = collected.failures.len();
        let Some(first) = collected.failures.into_iter().next() else {
            return Err(ProvisionError::timeout(Step::JoinFleetWorker));
        };
        error!(failed, requested = count, cause = %first, "fleet provisioning failed");
        Err(ProvisionError::PartialFleetFailure {
            failed,
            requested: count,
            first: Box::new(first),
        })
    }

    async fn collect(&self, mut workers: JoinSet<WorkerOutcome>, deadline: &Deadline) -> Collected {
        let mut collected = Collected::default();
        let join_by = saturating_instant(deadline.instant(), self.join_grace);
        loop {
            match tokio::time::timeout_at(join_by, workers.join_next()).await {
                Ok(Some(joined)) => collected.record(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = workers.len(), "fleet workers overran the deadline; aborting");
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        collected.record(joined);
                    }
                    break;
                }
            }
        }
        collected
    }

    /// Terminates every node that came up, plus any node an aborted worker
    /// may have left behind.
    async fn compensate(&self, spec: &InstallationSpec, count: usize, collected: &Collected) {
        let mut terminated = BTreeSet::new();
        for (_, node) in &collected.ready {
            self.nodes.terminate_quietly(node).await;
            terminated.insert(node.id.clone());
        }
        if collected.aborted == 0 {
            return;
        }

        let names = (1..=count)
            .map(|index| format!("{}{index}", spec.name_prefix))
            .collect::<BTreeSet<_>>();
        let filter = live_with_prefix(&spec.name_prefix);
        let listing = tokio::time::timeout(
            self.nodes.termination_timeout(),
            self.nodes.provider().list_nodes(&*filter),
        )
        .await;
        let leftovers = match listing {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(err)) => {
                warn!(error = %err, "could not list nodes left by aborted fleet workers");
                return;
            }
            Err(_) => {
                warn!("timed out listing nodes left by aborted fleet workers");
                return;
            }
        };
        for node in leftovers
            .iter()
            .filter(|node| names.contains(&node.name) && !terminated.contains(&node.id))
        {
            self.nodes.terminate_quietly(&node.to_descriptor()).await;
        }
    }

    /// Terminates every live node whose name starts with `prefix`; returns
    /// how many were terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Provider`] when no such node exists, when
    /// listing fails, or (after attempting every node) when any termination
    /// failed.
    pub async fn teardown_fleet(&self, prefix: &str) -> Result<usize, ProvisionError> {
        let provider = self.nodes.provider();
        let filter = live_with_prefix(prefix);
        let nodes = provider
            .list_nodes(&*filter)
            .await
            .map_err(|err| ProvisionError::provider("list nodes", &err))?;
        if nodes.is_empty() {
            return Err(ProvisionError::Provider {
                operation: String::from("teardown fleet"),
                message: format!("no nodes named {prefix}* found"),
            });
        }

        let mut failures = Vec::new();
        for node in &nodes {
            let call = provider.terminate_node(&node.id);
            match tokio::time::timeout(self.nodes.termination_timeout(), call).await {
                Ok(Ok(())) => info!(node_id = %node.id, name = %node.name, "fleet node terminated"),
                Ok(Err(err)) => {
                    warn!(node_id = %node.id, error = %err, "failed to terminate fleet node");
                    failures.push(format!("{}: {err}", node.name));
                }
                Err(_) => {
                    warn!(node_id = %node.id, "timed out terminating fleet node");
                    failures.push(format!("{}: timed out", node.name));
                }
            }
        }

        if failures.is_empty() {
            return Ok(nodes.len());
        }
        Err(ProvisionError::Provider {
            operation: String::from("teardown fleet"),
            message: format!(
                "{} of {} terminations failed: {}",
                failures.len(),
                nodes.len(),
                failures.join("; ")
            ),
        })
    }
}

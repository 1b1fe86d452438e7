//! Remote installer: drives one node from "just started" to "agent running".
//!
//! The node moves strictly forward through
//! `NotStarted → AwaitingReachability → PreparingRemoteDirectory →
//! StagingFiles → ExecutingRemoteSetup → AwaitingAgent → Ready`, or drops
//! into `Failed` from whichever state was active when an error surfaced.
//! Every state checks the deadline on entry.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::agent::AgentSignal;
use crate::deadline::Deadline;
use crate::error::{NodeFailure, ProvisionError, Step};
use crate::events::{ProvisioningEvent, ProvisioningListener, publish};
use crate::installation::{InstallationSpec, TransferKind};
use crate::node::{NodeDescriptor, RemoteCredential};
use crate::remote::{CommandRunner, RemoteExecutor, RemoteTarget, ShellFlavor, script};
use crate::transport::{FileTransport, SetupRetry, TransferReport, Transport};

/// Per-node installer state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstallerState {
    /// Nothing happened yet.
    NotStarted,
    /// Polling the transfer port.
    AwaitingReachability,
    /// Opening the transport and creating the remote directory.
    PreparingRemoteDirectory,
    /// Copying the payload.
    StagingFiles,
    /// Running the bootstrap script.
    ExecutingRemoteSetup,
    /// Waiting for the agent to register.
    AwaitingAgent,
    /// Installed and confirmed.
    Ready,
    /// Gave up.
    Failed,
}

impl InstallerState {
    /// Kebab-case label used in logs and error steps.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::AwaitingReachability => "awaiting-reachability",
            Self::PreparingRemoteDirectory => "preparing-remote-directory",
            Self::StagingFiles => "staging-files",
            Self::ExecutingRemoteSetup => "executing-remote-setup",
            Self::AwaitingAgent => "awaiting-agent",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// `Ready` or `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for InstallerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polling and retry knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstallerTimings {
    /// Pause between reachability probes.
    pub reachability_interval: Duration,
    /// Upper bound on one TCP connect attempt.
    pub connect_timeout: Duration,
    /// Transport setup attempts.
    pub transfer_retries: u32,
    /// Pause between transport setup attempts.
    pub retry_interval: Duration,
}

impl Default for InstallerTimings {
    fn default() -> Self {
        Self {
            reachability_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            transfer_retries: 3,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl InstallerTimings {
    /// Transport setup retry policy.
    #[must_use]
    pub const fn setup_retry(&self) -> SetupRetry {
        SetupRetry {
            attempts: self.transfer_retries,
            interval: self.retry_interval,
        }
    }
}

/// Returns `true` when a TCP connection to `target` succeeds within `budget`.
pub async fn tcp_reachable(target: SocketAddr, budget: Duration) -> bool {
    matches!(
        tokio::time::timeout(budget, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}

/// Tracks the current state and publishes every transition.
struct Progress<'a> {
    state: InstallerState,
    address: IpAddr,
    listener: &'a dyn ProvisioningListener,
}

impl Progress<'_> {
    fn advance(&mut self, state: InstallerState) {
        self.state = state;
        publish(
            self.listener,
            &ProvisioningEvent::InstallerStateChanged {
                address: self.address,
                state,
            },
        );
    }

    /// Advances to `state` and fails when the deadline already elapsed.
    fn enter(&mut self, state: InstallerState, deadline: &Deadline) -> Result<Duration, ProvisionError> {
        self.advance(state);
        deadline.remaining_for(Step::Install(state).to_string().as_str())
    }
}

/// Stages the payload on a node and confirms its agent.
pub struct RemoteInstaller<R: CommandRunner + 'static> {
    remote: RemoteExecutor<R>,
    agent: Arc<dyn AgentSignal>,
    listener: Arc<dyn ProvisioningListener>,
    timings: InstallerTimings,
}

impl<R: CommandRunner + 'static> Clone for RemoteInstaller<R> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            agent: Arc::clone(&self.agent),
            listener: Arc::clone(&self.listener),
            timings: self.timings,
        }
    }
}

impl<R: CommandRunner + 'static> fmt::Debug for RemoteInstaller<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInstaller")
            .field("remote", &self.remote)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner + 'static> RemoteInstaller<R> {
    /// Creates an installer.
    #[must_use]
    pub fn new(
        remote: RemoteExecutor<R>,
        agent: Arc<dyn AgentSignal>,
        listener: Arc<dyn ProvisioningListener>,
        timings: InstallerTimings,
    ) -> Self {
        Self {
            remote,
            agent,
            listener,
            timings,
        }
    }

    /// Returns the configured timings.
    #[must_use]
    pub const fn timings(&self) -> &InstallerTimings {
        &self.timings
    }

    /// Installs `node` with `credential`, bounded by `deadline`.
    ///
    /// With `agent_preinstalled` only the agent wait runs.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeFailure`] whose step names the installer state that
    /// was active when the error surfaced. The failure carries no descriptor;
    /// the caller attaches its own.
    pub async fn install(
        &self,
        spec: &InstallationSpec,
        node: &NodeDescriptor,
        credential: RemoteCredential,
        agent_preinstalled: bool,
        deadline: &Deadline,
    ) -> Result<(), NodeFailure> {
        let Some(address) = node.connect_address(spec.connect_to_private_ip) else {
            return Err(NodeFailure::new(
                Step::Install(InstallerState::AwaitingReachability),
                ProvisionError::HostUnreachable {
                    target: node.id.clone(),
                    port: spec.reachability_port(),
                },
            ));
        };

        let mut progress = Progress {
            state: InstallerState::NotStarted,
            address,
            listener: self.listener.as_ref(),
        };
        let outcome = self
            .drive(&mut progress, spec, node, credential, agent_preinstalled, deadline)
            .await;
        match outcome {
            Ok(()) => {
                progress.advance(InstallerState::Ready);
                info!(node_id = %node.id, %address, "node installed and agent confirmed");
                Ok(())
            }
            Err(err) => {
                let failed_in = progress.state;
                progress.advance(InstallerState::Failed);
                Err(NodeFailure::new(Step::Install(failed_in), err))
            }
        }
    }

    async fn drive(
        &self,
        progress: &mut Progress<'_>,
        spec: &InstallationSpec,
        node: &NodeDescriptor,
        credential: RemoteCredential,
        agent_preinstalled: bool,
        deadline: &Deadline,
    ) -> Result<(), ProvisionError> {
        let address = progress.address;
        if agent_preinstalled {
            info!(node_id = %node.id, %address, "agent preinstalled; skipping staging");
        } else {
            progress.enter(InstallerState::AwaitingReachability, deadline)?;
            self.await_reachability(address, spec.reachability_port(), deadline)
                .await?;

            progress.enter(InstallerState::PreparingRemoteDirectory, deadline)?;
            let target = RemoteTarget::new(address, &spec.connection, credential);
            let mut transport = Transport::for_spec(
                spec,
                target.clone(),
                self.remote.clone(),
                self.timings.setup_retry(),
            );
            let staged = Self::stage(&mut transport, spec, progress, deadline).await;
            transport.close();
            let report = staged?;
            info!(
                node_id = %node.id,
                uploaded = report.uploaded,
                skipped = report.skipped,
                "payload staged"
            );

            if let Some(bootstrap) = &spec.bootstrap_script {
                progress.enter(InstallerState::ExecutingRemoteSetup, deadline)?;
                let flavor = match spec.transfer_kind {
                    TransferKind::Share => ShellFlavor::Windows,
                    TransferKind::Scp | TransferKind::Sftp => ShellFlavor::Posix,
                };
                let environment = bootstrap_environment(spec, node, address);
                let command =
                    script::bootstrap_command(flavor, &spec.remote_dir, bootstrap, &environment);
                self.remote
                    .execute(
                        &target,
                        &command,
                        deadline,
                        Step::Install(InstallerState::ExecutingRemoteSetup),
                    )
                    .await?;
            }
        }

        let remaining = progress.enter(InstallerState::AwaitingAgent, deadline)?;
        if self.agent.wait_for_agent(address, remaining).await {
            Ok(())
        } else {
            Err(ProvisionError::AgentNotStarted { address })
        }
    }

    async fn stage(
        transport: &mut Transport<R>,
        spec: &InstallationSpec,
        progress: &mut Progress<'_>,
        deadline: &Deadline,
    ) -> Result<TransferReport, ProvisionError> {
        transport.initialize(deadline).await?;
        transport.prepare_directory(deadline).await?;
        progress.enter(InstallerState::StagingFiles, deadline)?;
        transport.copy_files(&spec.excluded, deadline).await
    }

    async fn await_reachability(
        &self,
        address: IpAddr,
        port: u16,
        deadline: &Deadline,
    ) -> Result<(), ProvisionError> {
        let target = SocketAddr::new(address, port);
        while let Some(budget) = deadline.cap(self.timings.connect_timeout) {
            if tcp_reachable(target, budget).await {
                debug!(%target, "host reachable");
                return Ok(());
            }
            debug!(%target, "host not reachable yet");
            if !deadline.sleep(self.timings.reachability_interval).await {
                break;
            }
        }
        Err(ProvisionError::HostUnreachable {
            target: address.to_string(),
            port,
        })
    }
}

/// Variables exported before the bootstrap script runs.
fn bootstrap_environment(
    spec: &InstallationSpec,
    node: &NodeDescriptor,
    address: IpAddr,
) -> BTreeMap<String, String> {
    let render = |value: Option<IpAddr>| value.map(|ip| ip.to_string()).unwrap_or_default();
    let mut environment = BTreeMap::from([
        (String::from("WORKING_HOME_DIRECTORY"), spec.remote_dir.clone()),
        (String::from("MACHINE_IP_ADDRESS"), address.to_string()),
        (String::from("NODE_PRIVATE_IP"), render(node.private_address)),
        (String::from("NODE_PUBLIC_IP"), render(node.public_address)),
        (String::from("NODE_ID"), node.id.clone()),
    ]);
    environment.extend(
        spec.environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    environment
}

//! Shared fixtures for single-node provisioning scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

use nodewright::test_support::{FakeProvider, FixedAgentSignal, RecordingListener, ScriptedRunner};
use nodewright::{
    AgentSignal, ConfigError, InstallationSpec, InstallerTimings, NodeDescriptor, NodeFailure,
    NodeProvisioner, ProvisionError, ProvisioningListener, RemoteAccessConfig, RemoteExecutor,
    RemoteInstaller,
};

use crate::rig::Rig;

#[derive(Debug, Error)]
pub enum ProvisionTestError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("invalid remote fixture: {0}")]
    Remote(#[from] ConfigError),
    #[error("invalid installation fixture: {0}")]
    Spec(#[from] ProvisionError),
}

/// One `provision_node` call and how long it took on the runtime clock.
#[derive(Debug)]
pub struct Run {
    pub result: Result<NodeDescriptor, NodeFailure>,
    pub elapsed: Duration,
}

/// A node whose agent is preinstalled, so nothing is staged over the wire.
#[derive(Debug)]
pub struct SimulatedNode {
    pub listener: RecordingListener,
}

impl SimulatedNode {
    pub fn spec() -> Result<InstallationSpec, ProvisionTestError> {
        Ok(InstallationSpec::builder()
            .name_prefix("sim")
            .local_dir("/srv/payload")
            .remote_dir("/opt/agent")
            .key_file(Some("/keys/id".into()))
            .build()?)
    }

    pub fn provisioner(
        &self,
        provider: &Arc<FakeProvider>,
    ) -> Result<NodeProvisioner<FakeProvider, ScriptedRunner>, ProvisionTestError> {
        let remote =
            RemoteExecutor::new(RemoteAccessConfig::defaults(), Arc::new(ScriptedRunner::new()))?;
        let listener: Arc<dyn ProvisioningListener> = Arc::new(self.listener.clone());
        let agent: Arc<dyn AgentSignal> = Arc::new(FixedAgentSignal::registered());
        let installer = RemoteInstaller::new(
            remote,
            agent,
            Arc::clone(&listener),
            InstallerTimings::default(),
        );
        Ok(NodeProvisioner::new(Arc::clone(provider), installer, listener)
            .with_poll_interval(Duration::from_millis(500)))
    }
}

#[derive(Clone)]
pub struct ProvisionContext {
    pub runtime: Option<Arc<Runtime>>,
    pub rig: Option<Arc<Rig>>,
    pub simulated: Option<Arc<SimulatedNode>>,
    pub provider: Arc<FakeProvider>,
    pub missing_payload: bool,
    pub runs: Vec<Arc<Run>>,
}

impl ProvisionContext {
    pub fn record(mut self, run: Run) -> Self {
        self.runs.push(Arc::new(run));
        self
    }

    pub fn last_run(&self) -> Option<&Run> {
        self.runs.last().map(AsRef::as_ref)
    }
}

#[fixture]
pub fn provision_context() -> ProvisionContext {
    ProvisionContext {
        runtime: None,
        rig: None,
        simulated: None,
        provider: Arc::new(FakeProvider::new()),
        missing_payload: false,
        runs: Vec::new(),
    }
}

/// Multi-threaded runtime for scenarios talking to real loopback sockets.
pub fn loopback_runtime() -> Result<Runtime, ProvisionTestError> {
    Ok(Runtime::new()?)
}

/// Single-threaded runtime whose clock only moves when every task idles.
pub fn paused_runtime() -> Result<Runtime, ProvisionTestError> {
    Ok(Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()?)
}

//! BDD step definitions for single-node provisioning.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio::time::Instant;

use nodewright::test_support::{FakeProvider, RecordingListener};
use nodewright::{InstallerState, NodeDescriptor, NodeFailure, ProvisionError, Step, TransferKind};

use super::test_helpers::{
    ProvisionContext, ProvisionTestError, Run, SimulatedNode, loopback_runtime, paused_runtime,
};
use crate::rig::{RECORDING_BOOTSTRAP, Rig};

const LOOPBACK_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] ProvisionTestError),
    #[error("failed to prepare the remote directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn assertion(message: impl Into<String>) -> StepError {
    StepError::Assertion(message.into())
}

fn with_loopback_rig(
    mut provision_context: ProvisionContext,
    bootstrap: &str,
) -> Result<ProvisionContext, StepError> {
    let runtime = loopback_runtime()?;
    let rig = runtime.block_on(Rig::start(bootstrap));
    provision_context.rig = Some(Arc::new(rig));
    provision_context.runtime = Some(Arc::new(runtime));
    Ok(provision_context)
}

fn with_simulated_node(
    mut provision_context: ProvisionContext,
    provider: FakeProvider,
) -> Result<ProvisionContext, StepError> {
    provision_context.runtime = Some(Arc::new(paused_runtime()?));
    provision_context.provider = Arc::new(provider.with_preinstalled_agent());
    provision_context.simulated = Some(Arc::new(SimulatedNode {
        listener: RecordingListener::new(),
    }));
    Ok(provision_context)
}

fn loopback_parts(
    provision_context: &ProvisionContext,
) -> Result<(Arc<Runtime>, Arc<Rig>), StepError> {
    match (&provision_context.runtime, &provision_context.rig) {
        (Some(runtime), Some(rig)) => Ok((Arc::clone(runtime), Arc::clone(rig))),
        _ => Err(assertion("test setup requires a loopback node")),
    }
}

fn provision_over_loopback(
    provision_context: ProvisionContext,
    kind: &str,
    delete_first: bool,
) -> Result<ProvisionContext, StepError> {
    let kind = kind
        .parse::<TransferKind>()
        .map_err(|err| assertion(err.to_string()))?;
    let (runtime, rig) = loopback_parts(&provision_context)?;
    let mut spec = rig.spec(kind, delete_first);
    if provision_context.missing_payload {
        spec.local_dir = spec.local_dir.join("missing");
    }
    let provisioner = rig.provisioner(&provision_context.provider);
    let (result, elapsed) = runtime.block_on(async {
        let started = Instant::now();
        let result = provisioner.provision_node(&spec, LOOPBACK_BUDGET).await;
        (result, started.elapsed())
    });
    Ok(provision_context.record(Run { result, elapsed }))
}

fn last_node(provision_context: &ProvisionContext) -> Result<&NodeDescriptor, StepError> {
    match provision_context.last_run().map(|run| &run.result) {
        Some(Ok(node)) => Ok(node),
        Some(Err(failure)) => Err(assertion(format!("expected a node, got: {failure}"))),
        None => Err(assertion("missing provisioning run")),
    }
}

fn last_failure(provision_context: &ProvisionContext) -> Result<&NodeFailure, StepError> {
    match provision_context.last_run().map(|run| &run.result) {
        Some(Err(failure)) => Ok(failure),
        Some(Ok(node)) => Err(assertion(format!("expected a failure, got node {}", node.name))),
        None => Err(assertion("missing provisioning run")),
    }
}

fn last_elapsed(provision_context: &ProvisionContext) -> Result<Duration, StepError> {
    provision_context
        .last_run()
        .map(|run| run.elapsed)
        .ok_or_else(|| assertion("missing provisioning run"))
}

fn rig(provision_context: &ProvisionContext) -> Result<&Rig, StepError> {
    provision_context
        .rig
        .as_deref()
        .ok_or_else(|| assertion("test setup requires a loopback node"))
}

#[given("a loopback node whose bootstrap records its run")]
fn recording_loopback_node(provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    with_loopback_rig(provision_context, RECORDING_BOOTSTRAP)
}

#[given("a loopback node whose bootstrap fails with \"{message}\"")]
fn failing_loopback_node(
    provision_context: ProvisionContext,
    message: String,
) -> Result<ProvisionContext, StepError> {
    let script = format!("#!/bin/sh\necho '{}' >&2\nexit 3\n", message.trim());
    with_loopback_rig(provision_context, &script)
}

#[given("the remote directory holds a stale file")]
fn stale_remote_file(provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let staged = rig(&provision_context)?.staged();
    fs::create_dir_all(&staged)?;
    fs::write(staged.join("stale.txt"), "left over")?;
    Ok(provision_context)
}

#[given("the payload directory is missing")]
fn payload_missing(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.missing_payload = true;
    provision_context
}

#[given("a simulated node that reports running after {secs} seconds")]
fn simulated_node_ready_after(
    provision_context: ProvisionContext,
    secs: u64,
) -> Result<ProvisionContext, StepError> {
    with_simulated_node(
        provision_context,
        FakeProvider::new().ready_after(Duration::from_secs(secs)),
    )
}

#[given("a simulated node that never reports running")]
fn simulated_node_never_ready(provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    with_simulated_node(provision_context, FakeProvider::new().never_ready())
}

#[when("I provision a node over \"{kind}\"")]
fn provision_node(provision_context: ProvisionContext, kind: String) -> Result<ProvisionContext, StepError> {
    provision_over_loopback(provision_context, kind.trim(), false)
}

#[when("a node is provisioned over \"{kind}\" after clearing the remote directory")]
fn provision_node_clearing_remote(
    provision_context: ProvisionContext,
    kind: String,
) -> Result<ProvisionContext, StepError> {
    provision_over_loopback(provision_context, kind.trim(), true)
}

#[when("I provision the simulated node within {secs} seconds")]
fn provision_simulated_node(
    provision_context: ProvisionContext,
    secs: u64,
) -> Result<ProvisionContext, StepError> {
    let (Some(runtime), Some(node)) = (&provision_context.runtime, &provision_context.simulated) else {
        return Err(assertion("test setup requires a simulated node"));
    };
    let provisioner = node.provisioner(&provision_context.provider)?;
    let spec = SimulatedNode::spec()?;
    let (result, elapsed) = runtime.block_on(async {
        let started = Instant::now();
        let result = provisioner
            .provision_node(&spec, Duration::from_secs(secs))
            .await;
        (result, started.elapsed())
    });
    Ok(provision_context.record(Run { result, elapsed }))
}

#[then("the node is installed with its agent running")]
fn node_is_ready(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let node = last_node(provision_context)?;
    if node.installed && node.agent_running {
        Ok(())
    } else {
        Err(assertion(format!("node {} is not ready: {node:?}", node.name)))
    }
}

#[then("the node is called \"{name}\"")]
fn node_is_called(provision_context: &ProvisionContext, name: String) -> Result<(), StepError> {
    let node = last_node(provision_context)?;
    if node.name == name.trim() {
        Ok(())
    } else {
        Err(assertion(format!("expected node {name}, got {}", node.name)))
    }
}

#[then("the staged payload omits excluded files")]
fn payload_staged_without_exclusions(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let staged = rig(provision_context)?.staged();
    let config = fs::read_to_string(staged.join("lib/agent.conf"))?;
    if config != "port=4174\n" {
        return Err(assertion(format!("unexpected staged config: {config:?}")));
    }
    if staged.join("secret.pem").exists() {
        return Err(assertion("excluded file was staged"));
    }
    Ok(())
}

#[then("the bootstrap ran for \"{ids}\"")]
fn bootstrap_ran_for(provision_context: &ProvisionContext, ids: String) -> Result<(), StepError> {
    let log = fs::read_to_string(rig(provision_context)?.staged().join("nodes"))?;
    let ran: Vec<&str> = log.lines().collect();
    let expected: Vec<&str> = ids.trim().split(',').collect();
    if ran == expected {
        Ok(())
    } else {
        Err(assertion(format!("bootstrap ran for {ran:?}, expected {expected:?}")))
    }
}

#[then("\"{program}\" ran {count} times")]
fn program_ran(provision_context: &ProvisionContext, program: String, count: usize) -> Result<(), StepError> {
    let ran = rig(provision_context)?.runner.count(program.trim());
    if ran == count {
        Ok(())
    } else {
        Err(assertion(format!("{program} ran {ran} times, expected {count}")))
    }
}

#[then("the stale file is gone")]
fn stale_file_removed(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let staged = rig(provision_context)?.staged();
    if staged.join("stale.txt").exists() {
        return Err(assertion("stale file survived staging"));
    }
    if !staged.join("bootstrap.sh").exists() {
        return Err(assertion("payload was not staged after clearing"));
    }
    Ok(())
}

#[then("no node was terminated")]
fn nothing_terminated(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let terminated = provision_context.provider.terminated_ids();
    if terminated.is_empty() {
        Ok(())
    } else {
        Err(assertion(format!("unexpected terminations: {terminated:?}")))
    }
}

#[then("the node was terminated exactly once")]
fn terminated_once(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let failure = last_failure(provision_context)?;
    let terminated = provision_context.provider.terminated_ids();
    let failed_id = failure.node().map(|node| node.id.clone());
    match terminated.as_slice() {
        [only] if failed_id.as_ref().is_none_or(|id| id == only) => Ok(()),
        _ => Err(assertion(format!(
            "expected one termination of {failed_id:?}, got {terminated:?}"
        ))),
    }
}

#[then("provisioning fails while executing the remote setup")]
fn fails_in_remote_setup(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let failure = last_failure(provision_context)?;
    if failure.step == Step::Install(InstallerState::ExecutingRemoteSetup) {
        Ok(())
    } else {
        Err(assertion(format!("failed in {} instead", failure.step)))
    }
}

#[then("the failure output mentions \"{text}\"")]
fn failure_output_mentions(provision_context: &ProvisionContext, text: String) -> Result<(), StepError> {
    let failure = last_failure(provision_context)?;
    let ProvisionError::RemoteCommandFailed { status, output, .. } = &failure.source else {
        return Err(assertion(format!("expected a remote command failure, got {}", failure.source)));
    };
    if *status == Some(3) && output.contains(text.trim()) {
        Ok(())
    } else {
        Err(assertion(format!("exit {status:?} with output {output:?}")))
    }
}

#[then("transport setup fails")]
fn transport_setup_fails(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let failure = last_failure(provision_context)?;
    if matches!(
        failure.source,
        ProvisionError::TransportSetupFailed {
            transport: TransferKind::Scp,
            ..
        }
    ) {
        Ok(())
    } else {
        Err(assertion(format!("unexpected failure: {failure}")))
    }
}

#[then("the failure is a startup timeout")]
fn startup_timeout(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let failure = last_failure(provision_context)?;
    if failure.step == Step::AwaitRunning
        && matches!(failure.source, ProvisionError::StartupTimeout { .. })
    {
        Ok(())
    } else {
        Err(assertion(format!("unexpected failure: {failure}")))
    }
}

#[then("provisioning took at least {secs} seconds")]
fn took_at_least(provision_context: &ProvisionContext, secs: u64) -> Result<(), StepError> {
    let elapsed = last_elapsed(provision_context)?;
    if elapsed >= Duration::from_secs(secs) {
        Ok(())
    } else {
        Err(assertion(format!("provisioning finished after {elapsed:?}")))
    }
}

#[then("provisioning took less than {secs} seconds")]
fn took_less_than(provision_context: &ProvisionContext, secs: u64) -> Result<(), StepError> {
    let elapsed = last_elapsed(provision_context)?;
    if elapsed < Duration::from_secs(secs) {
        Ok(())
    } else {
        Err(assertion(format!("provisioning took {elapsed:?}")))
    }
}

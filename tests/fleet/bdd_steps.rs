//! BDD step definitions for fleet provisioning.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use nodewright::{
    FleetProvisioner, NodeDescriptor, NodeStatus, ProvisionError, ProvisioningEvent, TransferKind,
};

use super::test_helpers::{FleetContext, LoopbackFleet, bootstrap_log, items};
use crate::rig::{RECORDING_BOOTSTRAP, Rig};

const BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn assertion(message: impl Into<String>) -> StepError {
    StepError::Assertion(message.into())
}

fn with_fleet(mut fleet_context: FleetContext, bootstrap: &str) -> Result<FleetContext, StepError> {
    let runtime = Runtime::new()?;
    let rig = runtime.block_on(Rig::start(bootstrap));
    let fleet = FleetProvisioner::new(rig.provisioner(&fleet_context.provider));
    fleet_context.fleet = Some(Arc::new(fleet));
    fleet_context.rig = Some(Arc::new(rig));
    fleet_context.runtime = Some(Arc::new(runtime));
    Ok(fleet_context)
}

type Parts = (Arc<Runtime>, Arc<Rig>, Arc<LoopbackFleet>);

fn parts(fleet_context: &FleetContext) -> Result<Parts, StepError> {
    match (&fleet_context.runtime, &fleet_context.rig, &fleet_context.fleet) {
        (Some(runtime), Some(rig), Some(fleet)) => {
            Ok((Arc::clone(runtime), Arc::clone(rig), Arc::clone(fleet)))
        }
        _ => Err(assertion("test setup requires a loopback fleet")),
    }
}

fn ready_nodes(fleet_context: &FleetContext) -> Result<&[NodeDescriptor], StepError> {
    match fleet_context.outcome.as_deref() {
        Some(Ok(nodes)) => Ok(nodes),
        Some(Err(err)) => Err(assertion(format!("expected a ready fleet, got: {err}"))),
        None => Err(assertion("missing fleet outcome")),
    }
}

#[given("a loopback fleet whose bootstrap records its run")]
fn recording_fleet(fleet_context: FleetContext) -> Result<FleetContext, StepError> {
    with_fleet(fleet_context, RECORDING_BOOTSTRAP)
}

#[given("a loopback fleet whose bootstrap fails on \"{node_id}\"")]
fn failing_fleet(fleet_context: FleetContext, node_id: String) -> Result<FleetContext, StepError> {
    let script = format!(
        "#!/bin/sh\nif [ \"$NODE_ID\" = {} ]; then exit 4; fi\n",
        node_id.trim()
    );
    with_fleet(fleet_context, &script)
}

#[given("an unrelated node \"{name}\" is running")]
fn unrelated_node(fleet_context: FleetContext, name: String) -> FleetContext {
    fleet_context
        .provider
        .insert_existing(name.trim(), NodeStatus::Running);
    fleet_context
}

#[when("I provision a fleet of {count} nodes over \"{kind}\"")]
fn provision_fleet(
    mut fleet_context: FleetContext,
    count: usize,
    kind: String,
) -> Result<FleetContext, StepError> {
    let kind = kind
        .trim()
        .parse::<TransferKind>()
        .map_err(|err| assertion(err.to_string()))?;
    let (runtime, rig, fleet) = parts(&fleet_context)?;
    let spec = rig.spec(kind, false);
    let outcome = runtime.block_on(fleet.provision_fleet(&spec, count, BUDGET));
    fleet_context.outcome = Some(Arc::new(outcome));
    Ok(fleet_context)
}

#[when("I tear down the fleet named \"{prefix}\"")]
fn tear_down(mut fleet_context: FleetContext, prefix: String) -> Result<FleetContext, StepError> {
    let (runtime, _, fleet) = parts(&fleet_context)?;
    let terminated = runtime
        .block_on(fleet.teardown_fleet(prefix.trim()))
        .map_err(|err| assertion(format!("teardown failed: {err}")))?;
    fleet_context.torn_down = Some(terminated);
    Ok(fleet_context)
}

#[then("the fleet nodes are \"{names}\"")]
fn fleet_nodes_are(fleet_context: &FleetContext, names: String) -> Result<(), StepError> {
    let actual: Vec<String> = ready_nodes(fleet_context)?
        .iter()
        .map(|node| node.name.clone())
        .collect();
    let expected = items(&names);
    if actual == expected {
        Ok(())
    } else {
        Err(assertion(format!("fleet nodes {actual:?}, expected {expected:?}")))
    }
}

#[then("every fleet node is ready")]
fn every_node_ready(fleet_context: &FleetContext) -> Result<(), StepError> {
    let nodes = ready_nodes(fleet_context)?;
    if !nodes.is_empty() && nodes.iter().all(NodeDescriptor::is_ready) {
        Ok(())
    } else {
        Err(assertion(format!("not every node is ready: {nodes:?}")))
    }
}

#[then("the bootstrap ran for \"{ids}\"")]
fn bootstrap_ran_for(fleet_context: &FleetContext, ids: String) -> Result<(), StepError> {
    let (_, rig, _) = parts(fleet_context)?;
    let ran = bootstrap_log(&rig);
    let expected: BTreeSet<String> = items(&ids).into_iter().collect();
    if ran == expected {
        Ok(())
    } else {
        Err(assertion(format!("bootstrap ran for {ran:?}, expected {expected:?}")))
    }
}

#[then("a fleet ready event was emitted")]
fn fleet_ready_event(fleet_context: &FleetContext) -> Result<(), StepError> {
    let (_, rig, _) = parts(fleet_context)?;
    if rig
        .listener
        .events()
        .iter()
        .any(|event| matches!(event, ProvisioningEvent::FleetReady { .. }))
    {
        Ok(())
    } else {
        Err(assertion("no FleetReady event was recorded"))
    }
}

#[then("the fleet fails with {failed} of {requested} nodes failed")]
fn fleet_fails(fleet_context: &FleetContext, failed: usize, requested: usize) -> Result<(), StepError> {
    match fleet_context.outcome.as_deref() {
        Some(Err(ProvisionError::PartialFleetFailure {
            failed: actual_failed,
            requested: actual_requested,
            ..
        })) if (*actual_failed, *actual_requested) == (failed, requested) => Ok(()),
        Some(other) => Err(assertion(format!("unexpected fleet outcome: {other:?}"))),
        None => Err(assertion("missing fleet outcome")),
    }
}

#[then("nodes \"{ids}\" were terminated")]
fn nodes_terminated(fleet_context: &FleetContext, ids: String) -> Result<(), StepError> {
    let mut terminated = fleet_context.provider.terminated_ids();
    terminated.sort();
    let expected = items(&ids);
    if terminated == expected {
        Ok(())
    } else {
        Err(assertion(format!("terminated {terminated:?}, expected {expected:?}")))
    }
}

#[then("only \"{names}\" were created")]
fn only_created(fleet_context: &FleetContext, names: String) -> Result<(), StepError> {
    let mut created = fleet_context.provider.created_names();
    created.sort();
    let expected = items(&names);
    if created == expected {
        Ok(())
    } else {
        Err(assertion(format!("created {created:?}, expected {expected:?}")))
    }
}

#[then("{count} fleet nodes were torn down")]
fn torn_down(fleet_context: &FleetContext, count: usize) -> Result<(), StepError> {
    match fleet_context.torn_down {
        Some(terminated) if terminated == count => Ok(()),
        other => Err(assertion(format!("torn down {other:?}, expected {count}"))),
    }
}

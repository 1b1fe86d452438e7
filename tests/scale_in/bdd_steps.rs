//! BDD step definitions for deduplicated scale-in.

use std::net::AddrParseError;
use std::sync::Arc;
use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

use nodewright::test_support::FakeProvider;
use nodewright::{
    CloudProvider, NodeSnapshot, NodeStatus, ScaleInDeduplicator, StoppingMachinesRegistry,
};

use super::test_helpers::{ScaleInContext, addresses, paused_runtime};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("invalid address in step: {0}")]
    Address(#[from] AddrParseError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn assertion(message: impl Into<String>) -> StepError {
    StepError::Assertion(message.into())
}

type Dedup = Arc<ScaleInDeduplicator<FakeProvider>>;

fn parts(scale_in_context: &ScaleInContext) -> Result<(Arc<Runtime>, Dedup), StepError> {
    match (&scale_in_context.runtime, &scale_in_context.dedup) {
        (Some(runtime), Some(dedup)) => Ok((Arc::clone(runtime), Arc::clone(dedup))),
        _ => Err(assertion("test setup requires a stop deduplicator")),
    }
}

#[given("web nodes at \"{list}\"")]
fn web_nodes(mut scale_in_context: ScaleInContext, list: String) -> Result<ScaleInContext, StepError> {
    let runtime = paused_runtime()?;
    let targets = addresses(&list)?;
    let count = targets.len();
    let provider = FakeProvider::new()
        .without_default_public_address()
        .with_private_address(None)
        .with_public_addresses(targets);
    runtime.block_on(async {
        for index in 0..count {
            provider
                .create_node(&format!("web{index}"))
                .await
                .map_err(|err| assertion(format!("node not created: {err}")))?;
        }
        Ok::<_, StepError>(())
    })?;
    scale_in_context.provider = Arc::new(provider);
    scale_in_context.runtime = Some(Arc::new(runtime));
    Ok(scale_in_context)
}

#[given("a stop deduplicator with a {secs} second window")]
fn stop_deduplicator(mut scale_in_context: ScaleInContext, secs: u64) -> ScaleInContext {
    let registry = StoppingMachinesRegistry::new(Duration::from_secs(secs));
    scale_in_context.dedup = Some(Arc::new(ScaleInDeduplicator::with_registry(
        Arc::clone(&scale_in_context.provider),
        registry,
    )));
    scale_in_context
}

#[when("stop requests for \"{list}\" arrive together")]
fn concurrent_requests(
    mut scale_in_context: ScaleInContext,
    list: String,
) -> Result<ScaleInContext, StepError> {
    let (runtime, dedup) = parts(&scale_in_context)?;
    let targets = addresses(&list)?;
    let answers = runtime.block_on(async move {
        let mut requests = JoinSet::new();
        for target in targets {
            let worker = Arc::clone(&dedup);
            requests.spawn(async move { worker.request_stop(target).await });
        }
        let mut answers = Vec::new();
        while let Some(joined) = requests.join_next().await {
            let answer = joined
                .map_err(|err| assertion(format!("stop task failed: {err}")))?
                .map_err(|err| assertion(format!("stop rejected: {err}")))?;
            answers.push(answer);
        }
        Ok::<_, StepError>(answers)
    })?;
    scale_in_context.answers.extend(answers);
    Ok(scale_in_context)
}

#[when("a stop request for \"{address}\" arrives")]
fn single_request(
    mut scale_in_context: ScaleInContext,
    address: String,
) -> Result<ScaleInContext, StepError> {
    let (runtime, dedup) = parts(&scale_in_context)?;
    let target = address.trim().parse()?;
    let answer = runtime
        .block_on(dedup.request_stop(target))
        .map_err(|err| assertion(format!("stop rejected: {err}")))?;
    scale_in_context.answers.push(answer);
    Ok(scale_in_context)
}

#[when("{secs} seconds pass")]
fn time_passes(scale_in_context: ScaleInContext, secs: u64) -> Result<ScaleInContext, StepError> {
    let (runtime, _) = parts(&scale_in_context)?;
    runtime.block_on(tokio::time::advance(Duration::from_secs(secs)));
    Ok(scale_in_context)
}

#[then("{count} stop requests were dispatched")]
fn dispatched(scale_in_context: &ScaleInContext, count: usize) -> Result<(), StepError> {
    let actual = scale_in_context.answers.iter().filter(|answer| **answer).count();
    if actual == count {
        Ok(())
    } else {
        Err(assertion(format!("{actual} requests dispatched, expected {count}")))
    }
}

#[then("the stop requests answered \"{list}\"")]
fn answered(scale_in_context: &ScaleInContext, list: String) -> Result<(), StepError> {
    let expected = list
        .split(',')
        .map(|item| item.trim().parse::<bool>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| assertion(err.to_string()))?;
    if scale_in_context.answers == expected {
        Ok(())
    } else {
        Err(assertion(format!(
            "answers {:?}, expected {expected:?}",
            scale_in_context.answers
        )))
    }
}

#[then("the provider stopped \"{list}\"")]
fn provider_stopped(scale_in_context: &ScaleInContext, list: String) -> Result<(), StepError> {
    let mut stopped = scale_in_context.provider.terminated_addresses();
    stopped.sort();
    let mut expected = addresses(&list)?;
    expected.sort();
    if stopped == expected {
        Ok(())
    } else {
        Err(assertion(format!("stopped {stopped:?}, expected {expected:?}")))
    }
}

#[then("node \"{name}\" is still running")]
fn still_running(scale_in_context: &ScaleInContext, name: String) -> Result<(), StepError> {
    let Some(runtime) = &scale_in_context.runtime else {
        return Err(assertion("test setup requires web nodes"));
    };
    let wanted = name.trim();
    let nodes = runtime
        .block_on(scale_in_context.provider.list_nodes(&|_: &NodeSnapshot| true))
        .map_err(|err| assertion(format!("listing failed: {err}")))?;
    let named: Vec<&NodeSnapshot> = nodes.iter().filter(|node| node.name == wanted).collect();
    match named.as_slice() {
        [node] if node.status == NodeStatus::Running => Ok(()),
        _ => Err(assertion(format!("expected {wanted} to be running, got {nodes:?}"))),
    }
}

#[then("no node was terminated")]
fn nothing_terminated(scale_in_context: &ScaleInContext) -> Result<(), StepError> {
    let terminated = scale_in_context.provider.terminated_ids();
    if terminated.is_empty() {
        Ok(())
    } else {
        Err(assertion(format!("unexpected terminations: {terminated:?}")))
    }
}

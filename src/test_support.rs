//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;

use crate::agent::{AgentSignal, SignalFuture};
use crate::events::{ProvisioningEvent, ProvisioningListener};
use crate::installer::InstallerState;
use crate::node::Secret;
use crate::provider::{
    CloudProvider, NodeFilter, NodeHandle, NodeSnapshot, NodeStatus, ProviderFuture,
};
use crate::remote::{CommandError, CommandFuture, CommandOutput, CommandRunner, Invocation};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// An exhausted queue answers with [`CommandError::Spawn`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<CommandOutput, CommandError>>>>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        locked(&self.invocations).clone()
    }

    fn push(&self, response: Result<CommandOutput, CommandError>) {
        locked(&self.responses).push_back(response);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a runner error.
    pub fn push_error(&self, error: CommandError) {
        self.push(Err(error));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> CommandFuture<'a> {
        Box::pin(async move {
            locked(&self.invocations).push(invocation.clone());
            locked(&self.responses).pop_front().unwrap_or_else(|| {
                Err(CommandError::Spawn {
                    program: invocation.program.clone(),
                    message: String::from("no scripted response available"),
                })
            })
        })
    }
}

/// Errors raised by [`FakeProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FakeProviderError {
    /// Creation was scripted to fail.
    #[error("creation of {name} rejected")]
    Rejected {
        /// Requested name.
        name: String,
    },
    /// No node carries the identifier.
    #[error("node {id} not found")]
    NotFound {
        /// Requested identifier.
        id: String,
    },
    /// Termination was scripted to fail.
    #[error("termination of {id} failed")]
    TerminateFailed {
        /// Node identifier.
        id: String,
    },
}

#[derive(Clone, Debug)]
struct FakeNode {
    snapshot: NodeSnapshot,
    created_at: Instant,
    pinned: bool,
}

#[derive(Debug)]
struct FakeState {
    nodes: Vec<FakeNode>,
    ready_after: Option<Duration>,
    settled_status: NodeStatus,
    private_address: Option<IpAddr>,
    public_addresses: VecDeque<IpAddr>,
    default_public_address: Option<IpAddr>,
    credential: Option<Secret>,
    agent_preinstalled: bool,
    rejected_names: HashSet<String>,
    fail_terminate: bool,
    acknowledge_delay: Option<Duration>,
    created: Vec<String>,
    terminated: Vec<String>,
    terminated_addresses: Vec<IpAddr>,
    describe_calls: usize,
    list_calls: usize,
}

/// Scriptable in-memory cloud adapter.
///
/// Nodes report `Pending` until `ready_after` elapsed since creation (tokio
/// clock), then the settled status (`Running` unless overridden). Addresses
/// default to the loopback address so reachability probes can succeed
/// against local listeners.
#[derive(Clone, Debug)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// Provider whose nodes are running immediately on loopback addresses.
    #[must_use]
    pub fn new() -> Self {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            state: Arc::new(Mutex::new(FakeState {
                nodes: Vec::new(),
                ready_after: Some(Duration::ZERO),
                settled_status: NodeStatus::Running,
                private_address: Some(loopback),
                public_addresses: VecDeque::new(),
                default_public_address: Some(loopback),
                credential: None,
                agent_preinstalled: false,
                rejected_names: HashSet::new(),
                fail_terminate: false,
                acknowledge_delay: None,
                created: Vec::new(),
                terminated: Vec::new(),
                terminated_addresses: Vec::new(),
                describe_calls: 0,
                list_calls: 0,
            })),
        }
    }

    /// Nodes become running `delay` after creation.
    #[must_use]
    pub fn ready_after(self, delay: Duration) -> Self {
        locked(&self.state).ready_after = Some(delay);
        self
    }

    /// Nodes stay pending forever.
    #[must_use]
    pub fn never_ready(self) -> Self {
        locked(&self.state).ready_after = None;
        self
    }

    /// Nodes settle in `status` instead of `Running`.
    #[must_use]
    pub fn settles_in(self, status: NodeStatus) -> Self {
        locked(&self.state).settled_status = status;
        self
    }

    /// New nodes take public addresses from `addresses` in order, then fall
    /// back to loopback.
    #[must_use]
    pub fn with_public_addresses(self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        locked(&self.state).public_addresses = addresses.into_iter().collect();
        self
    }

    /// Every node reports `address` as its private address.
    #[must_use]
    pub fn with_private_address(self, address: Option<IpAddr>) -> Self {
        locked(&self.state).private_address = address;
        self
    }

    /// Nodes report no public address unless one is queued.
    #[must_use]
    pub fn without_default_public_address(self) -> Self {
        locked(&self.state).default_public_address = None;
        self
    }

    /// Every node issues `credential`.
    #[must_use]
    pub fn issuing(self, credential: impl Into<String>) -> Self {
        locked(&self.state).credential = Some(Secret::new(credential));
        self
    }

    /// Nodes report a preinstalled agent.
    #[must_use]
    pub fn with_preinstalled_agent(self) -> Self {
        locked(&self.state).agent_preinstalled = true;
        self
    }

    /// Creation of `name` fails.
    #[must_use]
    pub fn rejecting(self, name: impl Into<String>) -> Self {
        locked(&self.state).rejected_names.insert(name.into());
        self
    }

    /// Every termination fails (after being recorded).
    #[must_use]
    pub fn failing_terminations(self) -> Self {
        locked(&self.state).fail_terminate = true;
        self
    }

    /// `create_node` registers the node, then waits `delay` before
    /// answering.
    #[must_use]
    pub fn acknowledging_after(self, delay: Duration) -> Self {
        locked(&self.state).acknowledge_delay = Some(delay);
        self
    }

    /// Adds a node that exists before the test starts; returns its id.
    pub fn insert_existing(&self, name: &str, status: NodeStatus) -> String {
        let mut state = locked(&self.state);
        let id = format!("existing-{}", state.nodes.len());
        let public_address = state.default_public_address;
        let private_address = state.private_address;
        state.nodes.push(FakeNode {
            snapshot: NodeSnapshot {
                id: id.clone(),
                name: name.to_owned(),
                status,
                private_address,
                public_address,
                credential: None,
                agent_preinstalled: false,
            },
            created_at: Instant::now(),
            pinned: true,
        });
        id
    }

    /// Names passed to `create_node`, in call order.
    #[must_use]
    pub fn created_names(&self) -> Vec<String> {
        locked(&self.state).created.clone()
    }

    /// Ids passed to `terminate_node`, in call order.
    #[must_use]
    pub fn terminated_ids(&self) -> Vec<String> {
        locked(&self.state).terminated.clone()
    }

    /// Addresses passed to `terminate_by_address`, in call order.
    #[must_use]
    pub fn terminated_addresses(&self) -> Vec<IpAddr> {
        locked(&self.state).terminated_addresses.clone()
    }

    /// Number of `describe_node` calls.
    #[must_use]
    pub fn describe_calls(&self) -> usize {
        locked(&self.state).describe_calls
    }

    /// Number of `list_nodes` calls.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        locked(&self.state).list_calls
    }

    fn current(state: &FakeState, node: &FakeNode) -> NodeSnapshot {
        let mut snapshot = node.snapshot.clone();
        if node.pinned {
            return snapshot;
        }
        let started = state
            .ready_after
            .is_some_and(|delay| node.created_at.elapsed() >= delay);
        snapshot.status = if started {
            state.settled_status.clone()
        } else {
            NodeStatus::Pending
        };
        snapshot
    }
}

impl CloudProvider for FakeProvider {
    type Error = FakeProviderError;

    fn create_node<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, NodeHandle, Self::Error> {
        Box::pin(async move {
            let (handle, delay) = {
                let mut state = locked(&self.state);
                state.created.push(name.to_owned());
                if state.rejected_names.contains(name) {
                    return Err(FakeProviderError::Rejected {
                        name: name.to_owned(),
                    });
                }
                let id = format!("node-{}", state.nodes.len());
                let public_address = state
                    .public_addresses
                    .pop_front()
                    .or(state.default_public_address);
                let snapshot = NodeSnapshot {
                    id: id.clone(),
                    name: name.to_owned(),
                    status: NodeStatus::Pending,
                    private_address: state.private_address,
                    public_address,
                    credential: state.credential.clone(),
                    agent_preinstalled: state.agent_preinstalled,
                };
                state.nodes.push(FakeNode {
                    snapshot,
                    created_at: Instant::now(),
                    pinned: false,
                });
                let handle = NodeHandle {
                    id,
                    name: name.to_owned(),
                };
                (handle, state.acknowledge_delay)
            };
            if let Some(wait) = delay {
                tokio::time::sleep(wait).await;
            }
            Ok(handle)
        })
    }

    fn describe_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, NodeSnapshot, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.describe_calls += 1;
            let node = state
                .nodes
                .iter()
                .find(|node| node.snapshot.id == id)
                .ok_or_else(|| FakeProviderError::NotFound { id: id.to_owned() })?;
            Ok(Self::current(&state, node))
        })
    }

    fn list_nodes<'a>(
        &'a self,
        filter: &'a NodeFilter,
    ) -> ProviderFuture<'a, Vec<NodeSnapshot>, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.list_calls += 1;
            Ok(state
                .nodes
                .iter()
                .map(|node| Self::current(&state, node))
                .filter(|snapshot| filter(snapshot))
                .collect())
        })
    }

    fn terminate_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.terminated.push(id.to_owned());
            if state.fail_terminate {
                return Err(FakeProviderError::TerminateFailed { id: id.to_owned() });
            }
            let node = state
                .nodes
                .iter_mut()
                .find(|node| node.snapshot.id == id)
                .ok_or_else(|| FakeProviderError::NotFound { id: id.to_owned() })?;
            node.snapshot.status = NodeStatus::Terminated;
            node.pinned = true;
            Ok(())
        })
    }

    fn terminate_by_address(&self, address: IpAddr) -> ProviderFuture<'_, bool, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.terminated_addresses.push(address);
            if state.fail_terminate {
                return Err(FakeProviderError::TerminateFailed {
                    id: address.to_string(),
                });
            }
            let node = state.nodes.iter_mut().find(|node| {
                node.snapshot.status != NodeStatus::Terminated && node.snapshot.has_address(address)
            });
            Ok(node.is_some_and(|node| {
                node.snapshot.status = NodeStatus::Terminated;
                node.pinned = true;
                true
            }))
        })
    }
}

/// Listener that keeps every event for later assertions.
#[derive(Clone, Debug, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<ProvisioningEvent>>>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<ProvisioningEvent> {
        locked(&self.events).clone()
    }

    /// Installer states published for `address`, in order.
    #[must_use]
    pub fn installer_states(&self, address: IpAddr) -> Vec<InstallerState> {
        locked(&self.events)
            .iter()
            .filter_map(|event| match event {
                ProvisioningEvent::InstallerStateChanged { address: seen, state }
                    if *seen == address =>
                {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }
}

impl ProvisioningListener for RecordingListener {
    fn on_event(&self, event: &ProvisioningEvent) {
        locked(&self.events).push(event.clone());
    }
}

/// Agent signal with a fixed answer that counts its waits.
#[derive(Debug, Default)]
pub struct FixedAgentSignal {
    registered: bool,
    waits: AtomicUsize,
}

impl FixedAgentSignal {
    /// Every wait succeeds immediately.
    #[must_use]
    pub const fn registered() -> Self {
        Self {
            registered: true,
            waits: AtomicUsize::new(0),
        }
    }

    /// Every wait fails once its timeout elapsed.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            registered: false,
            waits: AtomicUsize::new(0),
        }
    }

    /// Number of waits so far.
    #[must_use]
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl AgentSignal for FixedAgentSignal {
    fn wait_for_agent(&self, _address: IpAddr, timeout: Duration) -> SignalFuture<'_> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if !self.registered {
                tokio::time::sleep(timeout).await;
            }
            self.registered
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

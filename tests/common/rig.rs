//! Local stand-in for a node: a payload tree, a "remote" directory, and
//! listening SSH and agent ports on the loopback interface.
//!
//! Requires `common/loopback.rs` to be included as `mod loopback` alongside.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use tokio::net::TcpListener;

use nodewright::test_support::{FakeProvider, RecordingListener};
use nodewright::{
    AgentSignal, InstallationSpec, InstallerTimings, NodeProvisioner, PortProbeSignal,
    ProvisioningListener, RemoteAccessConfig, RemoteExecutor, RemoteInstaller, TransferKind,
};

use crate::loopback::LoopbackRunner;

/// Bootstrap script recording the role and node id it ran with.
pub const RECORDING_BOOTSTRAP: &str =
    "#!/bin/sh\necho \"$ROLE $NODE_ID\" > bootstrapped\necho \"$NODE_ID\" >> nodes\n";

pub struct Rig {
    payload: TempDir,
    remote: TempDir,
    ssh: TcpListener,
    agent: TcpListener,
    pub runner: Arc<LoopbackRunner>,
    pub listener: Arc<RecordingListener>,
}

impl Rig {
    pub async fn start(bootstrap: &str) -> Self {
        let payload = TempDir::new().expect("payload dir");
        let script = payload.path().join("bootstrap.sh");
        fs::write(&script, bootstrap).expect("write bootstrap");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod bootstrap");
        fs::create_dir(payload.path().join("lib")).expect("lib dir");
        fs::write(payload.path().join("lib/agent.conf"), "port=4174\n").expect("write conf");
        fs::write(payload.path().join("secret.pem"), "not for the node\n").expect("write secret");

        Self {
            payload,
            remote: TempDir::new().expect("remote dir"),
            ssh: TcpListener::bind("127.0.0.1:0").await.expect("bind ssh"),
            agent: TcpListener::bind("127.0.0.1:0").await.expect("bind agent"),
            runner: Arc::new(LoopbackRunner::new()),
            listener: Arc::new(RecordingListener::new()),
        }
    }

    fn port(listener: &TcpListener) -> u16 {
        listener.local_addr().expect("listener addr").port()
    }

    /// Directory the payload is staged into.
    pub fn staged(&self) -> PathBuf {
        self.remote.path().join("agent")
    }

    pub fn spec(&self, kind: TransferKind, delete_first: bool) -> InstallationSpec {
        let local = Utf8PathBuf::from_path_buf(self.payload.path().to_path_buf())
            .expect("utf8 payload dir");
        let remote = self.staged().to_str().expect("utf8 remote dir").to_owned();
        InstallationSpec::builder()
            .name_prefix("worker")
            .local_dir(local)
            .remote_dir(remote)
            .exclude("secret.pem")
            .transfer_kind(kind)
            .delete_remote_dir_contents(delete_first)
            .key_file(Some(Utf8PathBuf::from("/keys/id")))
            .ssh_port(Self::port(&self.ssh))
            .bootstrap_script(Some(String::from("bootstrap.sh")))
            .env("ROLE", "worker")
            .build()
            .expect("valid spec")
    }

    pub fn installer(&self) -> RemoteInstaller<LoopbackRunner> {
        let remote = RemoteExecutor::new(RemoteAccessConfig::defaults(), Arc::clone(&self.runner))
            .expect("valid remote config");
        let agent: Arc<dyn AgentSignal> = Arc::new(PortProbeSignal {
            port: Self::port(&self.agent),
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
        });
        let timings = InstallerTimings {
            reachability_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
            transfer_retries: 1,
            retry_interval: Duration::from_millis(10),
        };
        let listener: Arc<dyn ProvisioningListener> = Arc::clone(&self.listener) as _;
        RemoteInstaller::new(remote, agent, listener, timings)
    }

    pub fn provisioner(
        &self,
        provider: &Arc<FakeProvider>,
    ) -> NodeProvisioner<FakeProvider, LoopbackRunner> {
        NodeProvisioner::new(
            Arc::clone(provider),
            self.installer(),
            Arc::clone(&self.listener) as Arc<dyn ProvisioningListener>,
        )
        .with_poll_interval(Duration::from_millis(10))
    }
}

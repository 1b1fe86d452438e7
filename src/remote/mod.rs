//! Remote command execution through the OpenSSH and Samba client helpers.
//!
//! [`RemoteExecutor`] builds `ssh`, `scp`, `sftp` and `smbclient`
//! invocations for a [`RemoteTarget`] and runs them through a
//! [`CommandRunner`], bounding every call by the remaining deadline.

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::config::ConfigError;
use crate::deadline::Deadline;
use crate::error::{ProvisionError, Step};
use crate::node::RemoteCredential;

mod command;
mod config;
pub mod script;
mod ssh;
mod util;

pub use command::{
    CommandError, CommandFuture, CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT,
    Invocation, ProcessCommandRunner,
};
pub use config::RemoteAccessConfig;
pub use script::ShellFlavor;
pub use ssh::RemoteTarget;
pub use util::{expand_tilde, join_remote, scp_host};

/// Converts a helper failure into the provisioning taxonomy.
#[must_use]
pub fn command_failure(err: CommandError, step: Step) -> ProvisionError {
    match err {
        CommandError::TimedOut { .. } => ProvisionError::timeout(step),
        CommandError::Spawn { .. } => ProvisionError::Command(err),
    }
}

/// Runs helper processes against remote nodes.
pub struct RemoteExecutor<R: CommandRunner> {
    config: RemoteAccessConfig,
    runner: Arc<R>,
}

impl<R: CommandRunner> Clone for RemoteExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: CommandRunner> fmt::Debug for RemoteExecutor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn with_process_runner(config: RemoteAccessConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(ProcessCommandRunner))
    }
}

impl<R: CommandRunner> RemoteExecutor<R> {
    /// Creates an executor using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration validation fails.
    pub fn new(config: RemoteAccessConfig, runner: Arc<R>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteAccessConfig {
        &self.config
    }

    /// Builds an `ssh` invocation running `remote_command` on `target`.
    #[must_use]
    pub fn ssh_invocation(&self, target: &RemoteTarget, remote_command: &str) -> Invocation {
        let mut args = self.common_ssh_options(target, "-p");
        args.push(OsString::from(format!("{}@{}", target.user, target.host)));
        args.push(OsString::from(remote_command));
        self.wrap_credential(&self.config.ssh_bin, args, &target.credential)
    }

    /// Builds an `scp` invocation uploading `sources` into `remote_dir`.
    #[must_use]
    pub fn scp_invocation(
        &self,
        target: &RemoteTarget,
        sources: &[Utf8PathBuf],
        remote_dir: &str,
    ) -> Invocation {
        let mut args = self.common_ssh_options(target, "-P");
        args.push(OsString::from("-p"));
        args.extend(sources.iter().map(OsString::from));
        args.push(OsString::from(format!(
            "{}@{}:{}/",
            target.user,
            scp_host(target.host),
            remote_dir.trim_end_matches('/')
        )));
        self.wrap_credential(&self.config.scp_bin, args, &target.credential)
    }

    /// Builds an `sftp` invocation executing `batch_file`.
    #[must_use]
    pub fn sftp_invocation(&self, target: &RemoteTarget, batch_file: &Utf8Path) -> Invocation {
        let mut args = vec![OsString::from("-b"), OsString::from(batch_file)];
        args.extend(self.common_ssh_options(target, "-P"));
        if matches!(target.credential, RemoteCredential::Password(_)) {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=no"));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            target.user,
            scp_host(target.host)
        )));
        self.wrap_credential(&self.config.sftp_bin, args, &target.credential)
    }

    /// Builds an `smbclient` invocation running `commands` against `share`.
    #[must_use]
    pub fn smbclient_invocation(
        &self,
        target: &RemoteTarget,
        share: &str,
        auth_file: &Utf8Path,
        commands: &str,
    ) -> Invocation {
        let args = vec![
            OsString::from(format!("//{}/{share}", target.host)),
            OsString::from("-p"),
            OsString::from(target.share_port.to_string()),
            OsString::from("-A"),
            OsString::from(auth_file),
            OsString::from("-c"),
            OsString::from(commands),
        ];
        Invocation::new(self.config.smbclient_bin.clone(), args)
    }

    /// Runs `invocation` with its timeout capped by the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::TimeoutExceeded`] when no time remains or the
    /// helper overruns, and [`ProvisionError::Command`] when it cannot start.
    pub async fn run(
        &self,
        invocation: Invocation,
        deadline: &Deadline,
        step: Step,
    ) -> Result<CommandOutput, ProvisionError> {
        let budget = deadline
            .cap(self.config.command_timeout())
            .ok_or_else(|| ProvisionError::timeout(step))?;
        let bounded = invocation.with_timeout(budget);
        debug!(%step, command = %bounded.command_string(), "running helper");
        self.runner
            .run(&bounded)
            .await
            .map_err(|err| command_failure(err, step))
    }

    /// Like [`RemoteExecutor::run`] but treats a non-zero or missing exit
    /// status as [`ProvisionError::RemoteCommandFailed`].
    ///
    /// # Errors
    ///
    /// See [`RemoteExecutor::run`]; additionally fails on unsuccessful exit.
    pub async fn run_checked(
        &self,
        invocation: Invocation,
        deadline: &Deadline,
        step: Step,
    ) -> Result<CommandOutput, ProvisionError> {
        let command = invocation.command_string();
        let output = self.run(invocation, deadline, step).await?;
        require_success(command, output)
    }

    /// Executes `remote_command` over SSH and requires it to succeed.
    ///
    /// # Errors
    ///
    /// See [`RemoteExecutor::run_checked`].
    ///
    /// # Security
    ///
    /// `remote_command` is passed verbatim; callers quote interpolated values.
    pub async fn execute(
        &self,
        target: &RemoteTarget,
        remote_command: &str,
        deadline: &Deadline,
        step: Step,
    ) -> Result<CommandOutput, ProvisionError> {
        let invocation = self.ssh_invocation(target, remote_command);
        let output = self.run(invocation, deadline, step).await?;
        require_success(remote_command.to_owned(), output)
    }

    fn common_ssh_options(&self, target: &RemoteTarget, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(target.ssh_port.to_string()),
        ];

        match &target.credential {
            RemoteCredential::KeyFile(path) => {
                args.push(OsString::from("-i"));
                args.push(OsString::from(expand_tilde(path.as_str())));
                if self.config.batch_mode {
                    args.push(OsString::from("-o"));
                    args.push(OsString::from("BatchMode=yes"));
                }
            }
            RemoteCredential::Password(_) => {
                args.push(OsString::from("-o"));
                args.push(OsString::from("PubkeyAuthentication=no"));
            }
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));

        args
    }

    fn wrap_credential(
        &self,
        program: &str,
        args: Vec<OsString>,
        credential: &RemoteCredential,
    ) -> Invocation {
        match credential {
            RemoteCredential::KeyFile(_) => Invocation::new(program, args),
            RemoteCredential::Password(password) => {
                let mut wrapped = Vec::with_capacity(args.len() + 2);
                wrapped.push(OsString::from("-e"));
                wrapped.push(OsString::from(program));
                wrapped.extend(args);
                Invocation::new(self.config.sshpass_bin.clone(), wrapped)
                    .with_env("SSHPASS", password.clone())
            }
        }
    }
}

fn require_success(command: String, output: CommandOutput) -> Result<CommandOutput, ProvisionError> {
    if output.is_success() {
        return Ok(output);
    }
    Err(ProvisionError::RemoteCommandFailed {
        command,
        status: output.code,
        status_text: output.status_text(),
        output: output.combined(),
    })
}

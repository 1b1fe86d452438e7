//! Secure-file-transfer transport: size based incremental staging.
//!
//! The remote inventory (`relative path -> size`) is read once over SSH during
//! `initialize`. Uploads are written to an `sftp` batch file, so one session
//! stages every changed file.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;

use camino::Utf8PathBuf;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupStack;
use crate::deadline::Deadline;
use crate::error::ProvisionError;
use crate::installation::{InstallationSpec, TransferKind};
use crate::remote::{CommandRunner, RemoteExecutor, RemoteTarget, join_remote, script};

use super::{
    ExclusionRule, FileTransport, LocalTree, PREPARE_STEP, STAGE_STEP, SetupRetry, TransferReport,
    TransportFuture, ancestors_of, require_local_root, require_setup_time, setup_failure,
};

/// Parses `<size>\t<relative path>` lines produced by
/// [`script::inventory_command`].
#[must_use]
pub fn parse_inventory(stdout: &str) -> HashMap<String, u64> {
    stdout
        .lines()
        .filter_map(|line| {
            let (size, path) = line.split_once('\t')?;
            let parsed = size.trim().parse::<u64>().ok()?;
            let relative = path.trim_start_matches("./");
            (!relative.is_empty()).then(|| (relative.to_owned(), parsed))
        })
        .collect()
}

/// Quotes a path for an sftp batch file.
fn batch_quote(path: &str) -> String {
    format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Stages only files whose remote size differs.
#[derive(Debug)]
pub struct SftpTransport<R: CommandRunner> {
    remote: RemoteExecutor<R>,
    target: RemoteTarget,
    local_dir: Utf8PathBuf,
    remote_dir: String,
    delete_first: bool,
    retry: SetupRetry,
    inventory: HashMap<String, u64>,
    cleanup: CleanupStack,
    open: bool,
}

impl<R: CommandRunner> SftpTransport<R> {
    /// Creates a transport for `spec` against `target`.
    #[must_use]
    pub fn new(
        spec: &InstallationSpec,
        target: RemoteTarget,
        remote: RemoteExecutor<R>,
        retry: SetupRetry,
    ) -> Self {
        Self {
            remote,
            target,
            local_dir: spec.local_dir.clone(),
            remote_dir: spec.remote_dir.clone(),
            delete_first: spec.delete_remote_dir_contents,
            retry,
            inventory: HashMap::new(),
            cleanup: CleanupStack::new(),
            open: false,
        }
    }

    async fn read_inventory(&self, deadline: &Deadline) -> Result<HashMap<String, u64>, ProvisionError> {
        let command = script::inventory_command(&self.remote_dir);
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            require_setup_time(TransferKind::Sftp, deadline)?;
            let invocation = self.remote.ssh_invocation(&self.target, &command);
            let outcome = self.remote.run(invocation, deadline, PREPARE_STEP).await;
            let failure = match outcome {
                Ok(output) if output.is_success() => return Ok(parse_inventory(&output.stdout)),
                Ok(output) => format!(
                    "remote listing exited with status {}: {}",
                    output.status_text(),
                    output.combined()
                ),
                Err(err) => err.to_string(),
            };
            if attempt >= attempts {
                return Err(ProvisionError::TransportSetupFailed {
                    transport: TransferKind::Sftp,
                    message: format!("{failure} (after {attempt} attempts)"),
                });
            }
            warn!(attempt, error = %failure, host = %self.target.host, "sftp setup failed; retrying");
            attempt += 1;
            if !deadline.sleep(self.retry.interval).await {
                return Err(ProvisionError::TransportSetupFailed {
                    transport: TransferKind::Sftp,
                    message: failure,
                });
            }
        }
    }

    fn write_batch(&mut self, lines: &[String]) -> Result<Utf8PathBuf, ProvisionError> {
        let to_error = |err: std::io::Error| ProvisionError::LocalPayload {
            path: String::from("<sftp batch file>"),
            message: err.to_string(),
        };
        let mut file = Builder::new()
            .prefix("nodewright-sftp-")
            .suffix(".batch")
            .tempfile()
            .map_err(to_error)?;
        for line in lines {
            writeln!(file, "{line}").map_err(to_error)?;
        }
        file.flush().map_err(to_error)?;
        let temp_path = file.into_temp_path();
        let path = Utf8PathBuf::from_path_buf(temp_path.to_path_buf())
            .map_err(|_| to_error(std::io::Error::other("batch path is not UTF-8")))?;
        self.cleanup.defer_remove(temp_path);
        Ok(path)
    }
}

impl<R: CommandRunner> FileTransport for SftpTransport<R> {
    fn kind(&self) -> TransferKind {
        TransferKind::Sftp
    }

    fn initialize<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            require_setup_time(TransferKind::Sftp, deadline)?;
            require_local_root(TransferKind::Sftp, &self.local_dir)?;
            self.inventory = self
                .read_inventory(deadline)
                .await
                .map_err(|err| setup_failure(TransferKind::Sftp, &err))?;
            debug!(entries = self.inventory.len(), "remote inventory loaded");
            self.open = true;
            Ok(())
        })
    }

    fn prepare_directory<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let command = script::prepare_directory_command(&self.remote_dir, self.delete_first);
            self.remote
                .execute(&self.target, &command, deadline, PREPARE_STEP)
                .await?;
            if self.delete_first {
                self.inventory.clear();
            }
            Ok(())
        })
    }

    fn copy_files<'a>(
        &'a mut self,
        excluded: &'a [String],
        deadline: &'a Deadline,
    ) -> TransportFuture<'a, TransferReport> {
        Box::pin(async move {
            deadline.remaining_for(&STAGE_STEP.to_string())?;
            let tree = LocalTree::scan(&self.local_dir, excluded, ExclusionRule::FileName)?;

            let (changed, unchanged): (Vec<_>, Vec<_>) = tree
                .files
                .iter()
                .partition(|file| self.inventory.get(&file.relative) != Some(&file.size));

            let mut report = TransferReport {
                uploaded: 0,
                skipped: unchanged.len(),
            };
            if changed.is_empty() {
                info!(skipped = report.skipped, "sftp staging: remote copy is up to date");
                return Ok(report);
            }

            let directories = changed
                .iter()
                .flat_map(|file| ancestors_of(&file.relative))
                .collect::<BTreeSet<_>>();
            let mut lines = vec![format!("-mkdir {}", batch_quote(&self.remote_dir))];
            lines.extend(
                directories
                    .iter()
                    .map(|dir| format!("-mkdir {}", batch_quote(&join_remote(&self.remote_dir, dir)))),
            );
            lines.extend(changed.iter().map(|file| {
                format!(
                    "put {} {}",
                    batch_quote(file.absolute.as_str()),
                    batch_quote(&join_remote(&self.remote_dir, &file.relative))
                )
            }));

            let batch = self.write_batch(&lines)?;
            let invocation = self.remote.sftp_invocation(&self.target, &batch);
            self.remote.run_checked(invocation, deadline, STAGE_STEP).await?;

            for file in &changed {
                self.inventory.insert(file.relative.clone(), file.size);
            }
            report.uploaded = changed.len();
            info!(
                uploaded = report.uploaded,
                skipped = report.skipped,
                host = %self.target.host,
                "sftp staging complete"
            );
            Ok(report)
        })
    }

    fn close(&mut self) {
        self.cleanup.run();
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

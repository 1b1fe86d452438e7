//! Secure-copy transport: unconditional upload.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::deadline::Deadline;
use crate::installation::{InstallationSpec, TransferKind};
use crate::remote::{CommandRunner, RemoteExecutor, RemoteTarget, join_remote, script};

use super::{
    ExclusionRule, FileTransport, LocalTree, PREPARE_STEP, STAGE_STEP, TransferReport,
    TransportFuture, parent_of, require_local_root, require_setup_time,
};

/// Stages files with one `scp` call per directory.
#[derive(Debug)]
pub struct ScpTransport<R: CommandRunner> {
    remote: RemoteExecutor<R>,
    target: RemoteTarget,
    local_dir: Utf8PathBuf,
    remote_dir: String,
    delete_first: bool,
    open: bool,
}

impl<R: CommandRunner> ScpTransport<R> {
    /// Creates a transport for `spec` against `target`.
    #[must_use]
    pub fn new(spec: &InstallationSpec, target: RemoteTarget, remote: RemoteExecutor<R>) -> Self {
        Self {
            remote,
            target,
            local_dir: spec.local_dir.clone(),
            remote_dir: spec.remote_dir.clone(),
            delete_first: spec.delete_remote_dir_contents,
            open: false,
        }
    }
}

impl<R: CommandRunner> FileTransport for ScpTransport<R> {
    fn kind(&self) -> TransferKind {
        TransferKind::Scp
    }

    fn initialize<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            require_setup_time(TransferKind::Scp, deadline)?;
            require_local_root(TransferKind::Scp, &self.local_dir)?;
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
            let tree = LocalTree::scan(&self.local_dir, excluded, ExclusionRule::PathOrName)?;

            if !tree.directories.is_empty() {
                let dirs = tree
                    .directories
                    .iter()
                    .map(|dir| join_remote(&self.remote_dir, dir))
                    .collect::<Vec<_>>();
                self.remote
                    .execute(
                        &self.target,
                        &script::make_directories_command(&dirs),
                        deadline,
                        STAGE_STEP,
                    )
                    .await?;
            }

            let mut groups: BTreeMap<&str, Vec<Utf8PathBuf>> = BTreeMap::new();
            for file in &tree.files {
                groups
                    .entry(parent_of(&file.relative))
                    .or_default()
                    .push(file.absolute.clone());
            }

            for (parent, sources) in &groups {
                let destination = join_remote(&self.remote_dir, parent);
                debug!(files = sources.len(), %destination, "copying directory group");
                let invocation = self.remote.scp_invocation(&self.target, sources, &destination);
                self.remote.run_checked(invocation, deadline, STAGE_STEP).await?;
            }

            let report = TransferReport {
                uploaded: tree.files.len(),
                skipped: 0,
            };
            info!(uploaded = report.uploaded, host = %self.target.host, "scp staging complete");
            Ok(report)
        })
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

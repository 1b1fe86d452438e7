//! Windows file-share transport driven through `smbclient`.
//!
//! The remote directory `C:\agent\bin` maps to the administrative share `C$`
//! and the share path `agent\bin`. Incremental behaviour matches the sftp
//! transport: files whose remote size equals the local size are skipped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;

use camino::Utf8PathBuf;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupStack;
use crate::deadline::Deadline;
use crate::error::{ProvisionError, Step};
use crate::installation::{InstallationSpec, TransferKind};
use crate::node::RemoteCredential;
use crate::remote::{CommandOutput, CommandRunner, Invocation, RemoteExecutor, RemoteTarget};

use super::{
    ExclusionRule, FileTransport, LocalTree, PREPARE_STEP, STAGE_STEP, SetupRetry, TransferReport,
    TransportFuture, ancestors_of, require_local_root, require_setup_time, setup_failure,
};

const COLLISION: &str = "NT_STATUS_OBJECT_NAME_COLLISION";
const NOT_FOUND: [&str; 3] = [
    "NT_STATUS_NO_SUCH_FILE",
    "NT_STATUS_OBJECT_NAME_NOT_FOUND",
    "NT_STATUS_OBJECT_PATH_NOT_FOUND",
];

/// Share name and path inside the share.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShareLocation {
    /// Share name, for example `C$`.
    pub share: String,
    /// Backslash separated path inside the share; empty for the share root.
    pub path: String,
}

impl ShareLocation {
    /// Maps a remote directory to a share location.
    ///
    /// `X:\dir` maps to the administrative share `X$`. Any other value is
    /// read as `share\path` (forward slashes accepted).
    #[must_use]
    pub fn parse(remote_dir: &str) -> Self {
        let normalised = remote_dir.replace('/', "\\");
        let trimmed = normalised.trim_matches('\\');
        let mut chars = trimmed.chars();
        if let (Some(drive), Some(':')) = (chars.next(), chars.next())
            && drive.is_ascii_alphabetic()
        {
            return Self {
                share: format!("{}$", drive.to_ascii_uppercase()),
                path: chars.as_str().trim_matches('\\').to_owned(),
            };
        }
        let (share, path) = trimmed.split_once('\\').unwrap_or((trimmed, ""));
        Self {
            share: share.to_owned(),
            path: path.trim_matches('\\').to_owned(),
        }
    }

    /// Share path of `relative` (a `/` separated path below the location).
    #[must_use]
    pub fn join(&self, relative: &str) -> String {
        let converted = relative.replace('/', "\\");
        match (self.path.is_empty(), converted.is_empty()) {
            (true, _) => converted,
            (false, true) => self.path.clone(),
            (false, false) => format!("{}\\{converted}", self.path),
        }
    }

    /// Every directory from the share root down to the location itself.
    #[must_use]
    pub fn path_chain(&self) -> Vec<String> {
        if self.path.is_empty() {
            return Vec::new();
        }
        let mut chain = Vec::new();
        let mut current = String::new();
        for component in self.path.split('\\') {
            if !current.is_empty() {
                current.push('\\');
            }
            current.push_str(component);
            chain.push(current.clone());
        }
        chain
    }
}

/// Remote state recovered from a recursive `ls`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShareListing {
    /// Files (relative, `/` separated) and their sizes.
    pub files: HashMap<String, u64>,
    /// Directories (relative, `/` separated).
    pub directories: HashSet<String>,
}

/// Parses the output of `recurse ON; ls "<path>\*"` relative to `base`.
#[must_use]
pub fn parse_listing(stdout: &str, base: &str) -> ShareListing {
    let mut listing = ShareListing::default();
    let mut current = String::new();
    for line in stdout.lines() {
        if line.starts_with('\\') {
            let absolute = line.trim().trim_matches('\\');
            current = strip_base(absolute, base).unwrap_or_default();
            continue;
        }
        let Some((name, is_dir, size)) = parse_entry(line) else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        let relative = if current.is_empty() {
            name.to_owned()
        } else {
            format!("{current}/{name}")
        };
        if is_dir {
            listing.directories.insert(relative);
        } else {
            listing.files.insert(relative, size);
        }
    }
    listing
}

fn strip_base(absolute: &str, base: &str) -> Option<String> {
    let relative = if base.is_empty() {
        absolute
    } else if absolute.eq_ignore_ascii_case(base) {
        ""
    } else {
        absolute
            .get(..base.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(base))
            .and_then(|_| absolute.get(base.len()..))?
            .strip_prefix('\\')?
    };
    Some(relative.replace('\\', "/"))
}

fn split_last(text: &str) -> Option<(&str, &str)> {
    let trimmed = text.trim_end();
    let index = trimmed.rfind(char::is_whitespace)?;
    let (rest, token) = trimmed.split_at(index);
    Some((rest, token.trim()))
}

/// Parses `  name   ATTR   size  Www Mmm dd hh:mm:ss yyyy`.
fn parse_entry(line: &str) -> Option<(&str, bool, u64)> {
    let mut rest = line;
    for _ in 0..5 {
        rest = split_last(rest)?.0;
    }
    let (before_size, size) = split_last(rest)?;
    let size = size.parse::<u64>().ok()?;
    let (before_attrs, attrs) = split_last(before_size)?;
    if !attrs.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return None;
    }
    let name = before_attrs.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, attrs.contains('D'), size))
}

fn smb_quote(path: &str) -> String {
    format!("\"{}\"", path.replace('"', ""))
}

/// Lines reporting a failed smbclient command, ignoring `ignored` statuses.
fn status_errors<'a>(output: &'a CommandOutput, ignored: &[&str]) -> Vec<&'a str> {
    output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .filter(|line| line.contains("NT_STATUS_"))
        .filter(|line| !ignored.iter().any(|status| line.contains(status)))
        .collect()
}

/// Stages files onto a Windows share.
#[derive(Debug)]
pub struct ShareTransport<R: CommandRunner> {
    remote: RemoteExecutor<R>,
    target: RemoteTarget,
    local_dir: Utf8PathBuf,
    location: ShareLocation,
    delete_first: bool,
    retry: SetupRetry,
    listing: ShareListing,
    auth_file: Option<Utf8PathBuf>,
    cleanup: CleanupStack,
    open: bool,
}

impl<R: CommandRunner> ShareTransport<R> {
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
            location: ShareLocation::parse(&spec.remote_dir),
            delete_first: spec.delete_remote_dir_contents,
            retry,
            listing: ShareListing::default(),
            auth_file: None,
            cleanup: CleanupStack::new(),
            open: false,
        }
    }

    /// Share location derived from the remote directory.
    #[must_use]
    pub const fn location(&self) -> &ShareLocation {
        &self.location
    }

    fn write_auth_file(&mut self) -> Result<Utf8PathBuf, ProvisionError> {
        let RemoteCredential::Password(password) = &self.target.credential else {
            return Err(ProvisionError::TransportSetupFailed {
                transport: TransferKind::Share,
                message: String::from("the share transport requires password authentication"),
            });
        };
        let to_error = |source| ProvisionError::CredentialFile { source };
        let mut file = Builder::new()
            .prefix("nodewright-smb-")
            .suffix(".auth")
            .tempfile()
            .map_err(to_error)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(to_error)?;
        }
        writeln!(file, "username = {}", self.target.user).map_err(to_error)?;
        writeln!(file, "password = {}", password.expose()).map_err(to_error)?;
        file.flush().map_err(to_error)?;
        let temp_path = file.into_temp_path();
        let path = Utf8PathBuf::from_path_buf(temp_path.to_path_buf())
            .map_err(|_| to_error(std::io::Error::other("auth file path is not UTF-8")))?;
        self.cleanup.defer_remove(temp_path);
        Ok(path)
    }

    fn invocation(&self, commands: &str) -> Result<Invocation, ProvisionError> {
        let auth_file = self
            .auth_file
            .as_ref()
            .ok_or_else(|| ProvisionError::TransportSetupFailed {
                transport: TransferKind::Share,
                message: String::from("share session used before initialize"),
            })?;
        Ok(self
            .remote
            .smbclient_invocation(&self.target, &self.location.share, auth_file, commands))
    }

    async fn run_commands(
        &self,
        commands: &str,
        ignored: &[&str],
        deadline: &Deadline,
        step: Step,
    ) -> Result<CommandOutput, ProvisionError> {
        let invocation = self.invocation(commands)?;
        let output = self.remote.run(invocation, deadline, step).await?;
        let explained = output.is_success() || mentions_any(&output, ignored);
        if output.code.is_some() && explained && status_errors(&output, ignored).is_empty() {
            return Ok(output);
        }
        Err(ProvisionError::RemoteCommandFailed {
            command: format!("smbclient //{}/{} -c '{commands}'", self.target.host, self.location.share),
            status: output.code,
            status_text: output.status_text(),
            output: output.combined(),
        })
    }

    async fn read_listing(&self, deadline: &Deadline) -> Result<ShareListing, ProvisionError> {
        let pattern = self.location.join("*");
        let commands = format!("recurse ON; ls {}", smb_quote(&pattern));
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            require_setup_time(TransferKind::Share, deadline)?;
            match self.run_commands(&commands, &NOT_FOUND, deadline, PREPARE_STEP).await {
                Ok(output) => return Ok(parse_listing(&output.stdout, &self.location.path)),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, host = %self.target.host, "share listing failed; retrying");
                }
            }
            attempt += 1;
            if !deadline.sleep(self.retry.interval).await {
                return Err(ProvisionError::TransportSetupFailed {
                    transport: TransferKind::Share,
                    message: String::from("deadline elapsed while retrying the share listing"),
                });
            }
        }
    }
}

/// Returns `true` when the output reports one of the `ignored` statuses.
fn mentions_any(output: &CommandOutput, ignored: &[&str]) -> bool {
    output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .any(|line| ignored.iter().any(|status| line.contains(status)))
}

impl<R: CommandRunner> FileTransport for ShareTransport<R> {
    fn kind(&self) -> TransferKind {
        TransferKind::Share
    }

    fn initialize<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            require_setup_time(TransferKind::Share, deadline)?;
            require_local_root(TransferKind::Share, &self.local_dir)?;
            if self.auth_file.is_none() {
                let path = self.write_auth_file()?;
                self.auth_file = Some(path);
            }
            self.listing = self
                .read_listing(deadline)
                .await
                .map_err(|err| setup_failure(TransferKind::Share, &err))?;
            debug!(
                files = self.listing.files.len(),
                share = %self.location.share,
                "share listing loaded"
            );
            self.open = true;
            Ok(())
        })
    }

    fn prepare_directory<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut commands = Vec::new();
            if self.delete_first && !self.location.path.is_empty() {
                commands.push(format!("deltree {}", smb_quote(&self.location.path)));
            }
            commands.extend(
                self.location
                    .path_chain()
                    .iter()
                    .map(|dir| format!("mkdir {}", smb_quote(dir))),
            );
            if !commands.is_empty() {
                let ignored = [COLLISION, NOT_FOUND[0], NOT_FOUND[1], NOT_FOUND[2]];
                self.run_commands(&commands.join("; "), &ignored, deadline, PREPARE_STEP)
                    .await?;
            }
            if self.delete_first {
                self.listing = ShareListing::default();
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
                .partition(|file| self.listing.files.get(&file.relative) != Some(&file.size));
            let mut report = TransferReport {
                uploaded: 0,
                skipped: unchanged.len(),
            };
            if changed.is_empty() {
                info!(skipped = report.skipped, "share staging: remote copy is up to date");
                return Ok(report);
            }

            let missing_dirs = changed
                .iter()
                .flat_map(|file| ancestors_of(&file.relative))
                .filter(|dir| !self.listing.directories.contains(dir))
                .collect::<BTreeSet<_>>();
            let mut commands = missing_dirs
                .iter()
                .map(|dir| format!("mkdir {}", smb_quote(&self.location.join(dir))))
                .collect::<Vec<_>>();
            commands.extend(changed.iter().map(|file| {
                format!(
                    "put {} {}",
                    smb_quote(file.absolute.as_str()),
                    smb_quote(&self.location.join(&file.relative))
                )
            }));

            self.run_commands(&commands.join("; "), &[COLLISION], deadline, STAGE_STEP)
                .await?;

            self.listing.directories.extend(missing_dirs);
            for file in &changed {
                self.listing.files.insert(file.relative.clone(), file.size);
            }
            report.uploaded = changed.len();
            info!(
                uploaded = report.uploaded,
                skipped = report.skipped,
                share = %self.location.share,
                "share staging complete"
            );
            Ok(report)
        })
    }

    fn close(&mut self) {
        self.cleanup.run();
        self.auth_file = None;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

//! File transport strategies staging a local payload onto a node.
//!
//! Three interchangeable strategies share one contract ([`FileTransport`]):
//!
//! - [`ScpTransport`] uploads every non-excluded entry unconditionally.
//! - [`SftpTransport`] skips files already present remotely with the same
//!   size.
//! - [`ShareTransport`] behaves like sftp but addresses the node through a
//!   Windows file share.
//!
//! [`Transport`] is the tagged union selected from a [`TransferKind`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::deadline::Deadline;
use crate::error::{ProvisionError, Step};
use crate::installation::{InstallationSpec, TransferKind};
use crate::installer::InstallerState;
use crate::remote::{CommandRunner, RemoteExecutor, RemoteTarget};

mod local;
mod scp;
mod sftp;
mod share;

pub use local::{ExclusionRule, LocalFile, LocalTree, ancestors_of, parent_of};
pub use scp::ScpTransport;
pub use sftp::{SftpTransport, parse_inventory};
pub use share::{ShareListing, ShareLocation, ShareTransport, parse_listing};

/// Future returned by [`FileTransport`] operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// Step label used for session setup and directory preparation.
pub(crate) const PREPARE_STEP: Step = Step::Install(InstallerState::PreparingRemoteDirectory);

/// Step label used while copying files.
pub(crate) const STAGE_STEP: Step = Step::Install(InstallerState::StagingFiles);

/// Outcome of [`FileTransport::copy_files`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransferReport {
    /// Files uploaded.
    pub uploaded: usize,
    /// Files skipped because the remote copy already matched.
    pub skipped: usize,
}

/// Retry policy for session setup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetupRetry {
    /// Total attempts, at least one.
    pub attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for SetupRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(5),
        }
    }
}

/// Uniform "stage files onto a remote host" contract.
pub trait FileTransport: Send {
    /// Transport kind.
    fn kind(&self) -> TransferKind;

    /// Establishes whatever session context the transport needs.
    ///
    /// Fails with [`ProvisionError::TransportSetupFailed`] when the deadline
    /// already elapsed or the session cannot be established.
    fn initialize<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()>;

    /// Creates the remote target directory, deleting it first when the spec
    /// requests it.
    fn prepare_directory<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()>;

    /// Recursively stages the local source directory, honouring `excluded`.
    fn copy_files<'a>(
        &'a mut self,
        excluded: &'a [String],
        deadline: &'a Deadline,
    ) -> TransportFuture<'a, TransferReport>;

    /// Releases every session resource. Idempotent.
    fn close(&mut self);

    /// Returns `true` between a successful `initialize` and `close`.
    fn is_open(&self) -> bool;
}

/// Tagged union over the three strategies.
#[derive(Debug)]
pub enum Transport<R: CommandRunner + 'static> {
    /// Secure copy.
    Scp(ScpTransport<R>),
    /// Secure file transfer.
    Sftp(SftpTransport<R>),
    /// Windows file share.
    Share(ShareTransport<R>),
}

impl<R: CommandRunner + 'static> Transport<R> {
    /// Builds the strategy matching `spec.transfer_kind`.
    #[must_use]
    pub fn for_spec(
        spec: &InstallationSpec,
        target: RemoteTarget,
        remote: RemoteExecutor<R>,
        retry: SetupRetry,
    ) -> Self {
        match spec.transfer_kind {
            TransferKind::Scp => Self::Scp(ScpTransport::new(spec, target, remote)),
            TransferKind::Sftp => Self::Sftp(SftpTransport::new(spec, target, remote, retry)),
            TransferKind::Share => Self::Share(ShareTransport::new(spec, target, remote, retry)),
        }
    }

    fn inner(&mut self) -> &mut dyn FileTransport {
        match self {
            Self::Scp(inner) => inner,
            Self::Sftp(inner) => inner,
            Self::Share(inner) => inner,
        }
    }

    fn inner_ref(&self) -> &dyn FileTransport {
        match self {
            Self::Scp(inner) => inner,
            Self::Sftp(inner) => inner,
            Self::Share(inner) => inner,
        }
    }
}

impl<R: CommandRunner + 'static> FileTransport for Transport<R> {
    fn kind(&self) -> TransferKind {
        self.inner_ref().kind()
    }

    fn initialize<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        self.inner().initialize(deadline)
    }

    fn prepare_directory<'a>(&'a mut self, deadline: &'a Deadline) -> TransportFuture<'a, ()> {
        self.inner().prepare_directory(deadline)
    }

    fn copy_files<'a>(
        &'a mut self,
        excluded: &'a [String],
        deadline: &'a Deadline,
    ) -> TransportFuture<'a, TransferReport> {
        self.inner().copy_files(excluded, deadline)
    }

    fn close(&mut self) {
        self.inner().close();
    }

    fn is_open(&self) -> bool {
        self.inner_ref().is_open()
    }
}

/// Fails with [`ProvisionError::TransportSetupFailed`] when no time remains.
pub(crate) fn require_setup_time(kind: TransferKind, deadline: &Deadline) -> Result<(), ProvisionError> {
    if deadline.has_elapsed() {
        return Err(ProvisionError::TransportSetupFailed {
            transport: kind,
            message: String::from("deadline elapsed before the session was established"),
        });
    }
    Ok(())
}

/// Rewrites any setup failure as [`ProvisionError::TransportSetupFailed`].
pub(crate) fn setup_failure(kind: TransferKind, err: &ProvisionError) -> ProvisionError {
    let message = match err {
        ProvisionError::TransportSetupFailed { message, .. } => message.clone(),
        other => other.to_string(),
    };
    ProvisionError::TransportSetupFailed {
        transport: kind,
        message,
    }
}

/// Fails when the local payload root is missing.
pub(crate) fn require_local_root(kind: TransferKind, spec_root: &camino::Utf8Path) -> Result<(), ProvisionError> {
    if spec_root.is_dir() {
        return Ok(());
    }
    Err(ProvisionError::TransportSetupFailed {
        transport: kind,
        message: format!("local directory {spec_root} does not exist"),
    })
}

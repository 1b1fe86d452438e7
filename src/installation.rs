//! Installation payload description consumed by the remote installer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::ProvisionError;
use crate::node::Secret;

/// Default SSH port used by the scp and sftp transports.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SMB port used by the share transport.
pub const DEFAULT_SHARE_PORT: u16 = 445;

/// Remote file-copy protocol used to stage the payload.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Secure copy: unconditional upload of every non-excluded entry.
    #[default]
    Scp,
    /// Secure file transfer: incremental, size based.
    Sftp,
    /// Windows file share: incremental, addressed through a share path.
    Share,
}

impl TransferKind {
    /// Lower-case name used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scp => "scp",
            Self::Sftp => "sftp",
            Self::Share => "share",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferKind {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scp" => Ok(Self::Scp),
            "sftp" => Ok(Self::Sftp),
            "share" | "cifs" | "smb" => Ok(Self::Share),
            _ => Err(ProvisionError::UnsupportedTransport {
                kind: value.to_owned(),
            }),
        }
    }
}

/// How to authenticate and which ports to use when reaching a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionSettings {
    /// Remote user name.
    pub username: String,
    /// Pre-configured private key file.
    pub key_file: Option<Utf8PathBuf>,
    /// Pre-configured password.
    pub password: Option<Secret>,
    /// SSH port for the scp and sftp transports and remote commands.
    pub ssh_port: u16,
    /// SMB port for the share transport.
    pub share_port: u16,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            username: String::from("root"),
            key_file: None,
            password: None,
            ssh_port: DEFAULT_SSH_PORT,
            share_port: DEFAULT_SHARE_PORT,
        }
    }
}

/// Everything needed to stage and bootstrap a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallationSpec {
    /// Prefix for generated node names.
    pub name_prefix: String,
    /// Local directory whose contents are staged.
    pub local_dir: Utf8PathBuf,
    /// Target directory on the node.
    pub remote_dir: String,
    /// Relative paths or base names to skip.
    pub excluded: Vec<String>,
    /// Transport used for staging.
    pub transfer_kind: TransferKind,
    /// Delete and recreate the remote directory before staging.
    pub delete_remote_dir_contents: bool,
    /// Authentication and ports.
    pub connection: ConnectionSettings,
    /// Reach the node through its private address instead of its public one.
    pub connect_to_private_ip: bool,
    /// Script (relative to `remote_dir`) that starts the management agent.
    pub bootstrap_script: Option<String>,
    /// Extra environment exported before the bootstrap script runs.
    pub environment: BTreeMap<String, String>,
}

impl InstallationSpec {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> InstallationSpecBuilder {
        InstallationSpecBuilder::default()
    }

    /// Port probed during the reachability phase.
    #[must_use]
    pub const fn reachability_port(&self) -> u16 {
        match self.transfer_kind {
            TransferKind::Scp | TransferKind::Sftp => self.connection.ssh_port,
            TransferKind::Share => self.connection.share_port,
        }
    }

    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidSpec`] naming the offending field.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require(&self.name_prefix, "name_prefix")?;
        require(self.local_dir.as_str(), "local_dir")?;
        require(&self.remote_dir, "remote_dir")?;
        require(&self.connection.username, "username")?;
        if let Some(script) = &self.bootstrap_script {
            require(script, "bootstrap_script")?;
        }
        if self.connection.ssh_port == 0 {
            return Err(invalid("ssh_port", "must be non-zero"));
        }
        if self.connection.share_port == 0 {
            return Err(invalid("share_port", "must be non-zero"));
        }
        if let Some(key) = self.environment.keys().find(|key| !is_env_name(key)) {
            return Err(ProvisionError::InvalidSpec {
                field: String::from("environment"),
                reason: format!("'{key}' is not a valid variable name"),
            });
        }
        Ok(())
    }
}

/// Whether `key` can be exported as a shell variable: a letter or
/// underscore followed by letters, digits or underscores.
pub(crate) fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn require(value: &str, field: &str) -> Result<(), ProvisionError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ProvisionError {
    ProvisionError::InvalidSpec {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Builder for [`InstallationSpec`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default)]
pub struct InstallationSpecBuilder {
    name_prefix: String,
    local_dir: Utf8PathBuf,
    remote_dir: String,
    excluded: Vec<String>,
    transfer_kind: TransferKind,
    delete_remote_dir_contents: bool,
    connection: ConnectionSettings,
    connect_to_private_ip: bool,
    bootstrap_script: Option<String>,
    environment: BTreeMap<String, String>,
}

impl InstallationSpecBuilder {
    /// Sets the node name prefix.
    #[must_use]
    pub fn name_prefix(mut self, value: impl Into<String>) -> Self {
        self.name_prefix = value.into();
        self
    }

    /// Sets the local source directory.
    #[must_use]
    pub fn local_dir(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.local_dir = value.into();
        self
    }

    /// Sets the remote target directory.
    #[must_use]
    pub fn remote_dir(mut self, value: impl Into<String>) -> Self {
        self.remote_dir = value.into();
        self
    }

    /// Adds an excluded relative path or base name.
    #[must_use]
    pub fn exclude(mut self, value: impl Into<String>) -> Self {
        self.excluded.push(value.into());
        self
    }

    /// Selects the transport.
    #[must_use]
    pub const fn transfer_kind(mut self, value: TransferKind) -> Self {
        self.transfer_kind = value;
        self
    }

    /// Requests deletion of the remote directory before staging.
    #[must_use]
    pub const fn delete_remote_dir_contents(mut self, value: bool) -> Self {
        self.delete_remote_dir_contents = value;
        self
    }

    /// Sets the remote user.
    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.connection.username = value.into();
        self
    }

    /// Sets the fallback key file.
    #[must_use]
    pub fn key_file(mut self, value: Option<Utf8PathBuf>) -> Self {
        self.connection.key_file = value;
        self
    }

    /// Sets the fallback password.
    #[must_use]
    pub fn password(mut self, value: Option<Secret>) -> Self {
        self.connection.password = value;
        self
    }

    /// Overrides the SSH port.
    #[must_use]
    pub const fn ssh_port(mut self, value: u16) -> Self {
        self.connection.ssh_port = value;
        self
    }

    /// Overrides the SMB port.
    #[must_use]
    pub const fn share_port(mut self, value: u16) -> Self {
        self.connection.share_port = value;
        self
    }

    /// Reach nodes through their private address.
    #[must_use]
    pub const fn connect_to_private_ip(mut self, value: bool) -> Self {
        self.connect_to_private_ip = value;
        self
    }

    /// Sets the bootstrap script.
    #[must_use]
    pub fn bootstrap_script(mut self, value: Option<String>) -> Self {
        self.bootstrap_script = value;
        self
    }

    /// Adds an exported environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the spec.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidSpec`] when a required field is empty.
    pub fn build(self) -> Result<InstallationSpec, ProvisionError> {
        let mut connection = self.connection;
        connection.username = connection.username.trim().to_owned();
        let spec = InstallationSpec {
            name_prefix: self.name_prefix.trim().to_owned(),
            local_dir: self.local_dir,
            remote_dir: self.remote_dir.trim().to_owned(),
            excluded: self
                .excluded
                .into_iter()
                .map(|entry| entry.trim().trim_matches('/').to_owned())
                .filter(|entry| !entry.is_empty())
                .collect(),
            transfer_kind: self.transfer_kind,
            delete_remote_dir_contents: self.delete_remote_dir_contents,
            connection,
            connect_to_private_ip: self.connect_to_private_ip,
            bootstrap_script: self
                .bootstrap_script
                .map(|script| script.trim().to_owned()),
            environment: self.environment,
        };
        spec.validate()?;
        Ok(spec)
    }
}

//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::installation::{InstallationSpec, TransferKind, is_env_name};
use crate::installer::InstallerTimings;
use crate::node::Secret;

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. While not required for
    /// API calls, it is captured to support future audit logging.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new nodes.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

pub(crate) fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in nodewright.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodewright")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Default port on which a registered management agent accepts connections.
pub const DEFAULT_AGENT_PORT: u16 = 4174;

/// What to install, how to reach the nodes, and how long to wait.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEWRIGHT",
    discovery(
        app_name = "nodewright",
        env_var = "NODEWRIGHT_CONFIG_PATH",
        config_file_name = "nodewright.toml",
        dotfile_name = ".nodewright.toml",
        project_file_name = "nodewright.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "user-facing toggles are naturally expressed as booleans"
)]
pub struct ProvisioningConfig {
    /// Prefix of generated node names.
    #[ortho_config(default = "node".to_owned())]
    pub name_prefix: String,
    /// Local directory holding the installation payload.
    pub local_dir: String,
    /// Directory on the node receiving the payload.
    pub remote_dir: String,
    /// Comma separated relative paths or base names to skip.
    pub excluded_paths: Option<String>,
    /// Transfer protocol: `scp`, `sftp` or `share`.
    #[ortho_config(default = "scp".to_owned())]
    pub transfer_kind: String,
    /// Remote login name.
    #[ortho_config(default = "root".to_owned())]
    pub username: String,
    /// Private key used when the provider issues no credential.
    pub key_file: Option<String>,
    /// Password used when neither the provider nor `key_file` supply one.
    pub password: Option<String>,
    /// SSH port override.
    pub ssh_port: Option<u16>,
    /// SMB port override.
    pub share_port: Option<u16>,
    /// Whether to empty the remote directory before staging.
    #[ortho_config(default = false)]
    pub delete_remote_dir_contents: bool,
    /// Whether to reach nodes through their private address.
    #[ortho_config(default = false)]
    pub connect_to_private_ip: bool,
    /// Script, relative to `remote_dir`, that starts the agent.
    pub bootstrap_script: Option<String>,
    /// Comma separated `KEY=VALUE` pairs exported before the bootstrap script.
    pub environment: Option<String>,
    /// Port the management agent listens on once registered.
    #[ortho_config(default = DEFAULT_AGENT_PORT)]
    pub agent_port: u16,
    /// Pause between provider status polls, in seconds.
    #[ortho_config(default = 5)]
    pub status_poll_secs: u64,
    /// Pause between reachability probes, in seconds.
    #[ortho_config(default = 5)]
    pub reachability_interval_secs: u64,
    /// Transport setup attempts.
    #[ortho_config(default = 3)]
    pub transfer_retries: u32,
    /// Budget for one provisioning call, in seconds.
    #[ortho_config(default = 1800)]
    pub timeout_secs: u64,
    /// Default number of fleet nodes.
    #[ortho_config(default = 1)]
    pub fleet_size: usize,
}

impl ProvisioningConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodewright")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks required values and non-zero intervals.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and TOML key to set, or [`ConfigError::Invalid`] for malformed values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.name_prefix,
            &FieldMetadata::new("node name prefix", "NODEWRIGHT_NAME_PREFIX", "name_prefix", "provisioning"),
        )?;
        require_field(
            &self.local_dir,
            &FieldMetadata::new("payload directory", "NODEWRIGHT_LOCAL_DIR", "local_dir", "provisioning"),
        )?;
        require_field(
            &self.remote_dir,
            &FieldMetadata::new("remote directory", "NODEWRIGHT_REMOTE_DIR", "remote_dir", "provisioning"),
        )?;
        for (value, key) in [
            (self.status_poll_secs, "status_poll_secs"),
            (self.reachability_interval_secs, "reachability_interval_secs"),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be positive")));
            }
        }
        self.transfer_kind()?;
        self.environment_pairs()?;
        Ok(())
    }

    /// Parsed transfer protocol.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown protocols.
    pub fn transfer_kind(&self) -> Result<TransferKind, ConfigError> {
        self.transfer_kind
            .parse()
            .map_err(|err: crate::error::ProvisionError| ConfigError::Invalid(err.to_string()))
    }

    fn excluded(&self) -> Vec<String> {
        self.excluded_paths
            .as_deref()
            .map(|paths| {
                paths
                    .split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn environment_pairs(&self) -> Result<Vec<(String, String)>, ConfigError> {
        let Some(raw) = self.environment.as_deref() else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair
                    .split_once('=')
                    .map(|(key, value)| (key.trim(), value.trim()))
                    .filter(|(key, _)| !key.is_empty())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("environment entry '{pair}' is not KEY=VALUE"))
                    })?;
                if !is_env_name(key) {
                    return Err(ConfigError::Invalid(format!(
                        "environment name '{key}' must match [A-Za-z_][A-Za-z0-9_]*"
                    )));
                }
                Ok((key.to_owned(), value.to_owned()))
            })
            .collect()
    }

    /// Builds the installation spec described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn to_spec(&self) -> Result<InstallationSpec, ConfigError> {
        self.validate()?;
        let mut builder = InstallationSpec::builder()
            .name_prefix(&self.name_prefix)
            .local_dir(Utf8PathBuf::from(&self.local_dir))
            .remote_dir(&self.remote_dir)
            .transfer_kind(self.transfer_kind()?)
            .delete_remote_dir_contents(self.delete_remote_dir_contents)
            .username(&self.username)
            .key_file(self.key_file.as_deref().map(Utf8PathBuf::from))
            .password(self.password.clone().map(Secret::from))
            .connect_to_private_ip(self.connect_to_private_ip)
            .bootstrap_script(self.bootstrap_script.clone());
        if let Some(port) = self.ssh_port {
            builder = builder.ssh_port(port);
        }
        if let Some(port) = self.share_port {
            builder = builder.share_port(port);
        }
        for path in self.excluded() {
            builder = builder.exclude(path);
        }
        for (key, value) in self.environment_pairs()? {
            builder = builder.env(key, value);
        }
        builder
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Installer polling and retry settings.
    #[must_use]
    pub fn timings(&self) -> InstallerTimings {
        InstallerTimings {
            reachability_interval: Duration::from_secs(self.reachability_interval_secs),
            transfer_retries: self.transfer_retries,
            ..InstallerTimings::default()
        }
    }

    /// Pause between provider status polls.
    #[must_use]
    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs)
    }

    /// Default provisioning budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

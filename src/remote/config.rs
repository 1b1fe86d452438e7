//! Remote access configuration: helper binaries and SSH client options.
//!
//! Loaded via `ortho-config`, which merges defaults, configuration files, and
//! environment variables prefixed with `NODEWRIGHT_REMOTE_`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// Helper binaries and SSH options used to reach nodes.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEWRIGHT_REMOTE",
    discovery(
        app_name = "nodewright",
        env_var = "NODEWRIGHT_CONFIG_PATH",
        config_file_name = "nodewright.toml",
        dotfile_name = ".nodewright.toml",
        project_file_name = "nodewright.toml"
    )
)]
pub struct RemoteAccessConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sftp` executable.
    #[ortho_config(default = "sftp".to_owned())]
    pub sftp_bin: String,
    /// Path to the `smbclient` executable used by the share transport.
    #[ortho_config(default = "smbclient".to_owned())]
    pub smbclient_bin: String,
    /// Path to `sshpass`, used to feed passwords to the SSH helpers.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Whether to force batch mode for key based SSH to avoid prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking; disabled by default because
    /// freshly provisioned nodes have unknown host keys.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// TCP connect timeout handed to the SSH helpers, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Upper bound for any single helper invocation, in seconds. The
    /// remaining deadline shortens it further.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
}

impl RemoteAccessConfig {
    /// Configuration with every field at its default value.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sftp_bin: String::from("sftp"),
            smbclient_bin: String::from("smbclient"),
            sshpass_bin: String::from("sshpass"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
            command_timeout_secs: 600,
        }
    }

    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodewright")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures helper paths are present and timeouts are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, key, env_var) in [
            (&self.ssh_bin, "ssh_bin", "NODEWRIGHT_REMOTE_SSH_BIN"),
            (&self.scp_bin, "scp_bin", "NODEWRIGHT_REMOTE_SCP_BIN"),
            (&self.sftp_bin, "sftp_bin", "NODEWRIGHT_REMOTE_SFTP_BIN"),
            (&self.smbclient_bin, "smbclient_bin", "NODEWRIGHT_REMOTE_SMBCLIENT_BIN"),
            (&self.sshpass_bin, "sshpass_bin", "NODEWRIGHT_REMOTE_SSHPASS_BIN"),
        ] {
            require_field(value, &FieldMetadata::new(key, env_var, key, "remote"))?;
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::MissingField(String::from(
                "connect_timeout_secs must be positive: set NODEWRIGHT_REMOTE_CONNECT_TIMEOUT_SECS",
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::MissingField(String::from(
                "command_timeout_secs must be positive: set NODEWRIGHT_REMOTE_COMMAND_TIMEOUT_SECS",
            )));
        }
        Ok(())
    }

    /// TCP connect timeout for the SSH helpers.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Upper bound for a single helper invocation.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

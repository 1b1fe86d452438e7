//! Node descriptors and the credentials used to reach them.

use std::fmt;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use serde::Serialize;

/// String that must never appear in logs or debug output.
#[derive(Clone, Eq, PartialEq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the secret is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credential handed to the remote installer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCredential {
    /// Private key file on local disk.
    KeyFile(Utf8PathBuf),
    /// Literal password.
    Password(Secret),
}

impl RemoteCredential {
    /// Returns the key file path, if this is key based.
    #[must_use]
    pub const fn key_file(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::KeyFile(path) => Some(path),
            Self::Password(_) => None,
        }
    }

    /// Returns the password, if this is password based.
    #[must_use]
    pub const fn password(&self) -> Option<&Secret> {
        match self {
            Self::KeyFile(_) => None,
            Self::Password(secret) => Some(secret),
        }
    }
}

/// One cloud compute node as seen by the provisioning core.
///
/// A descriptor is created once the provider acknowledges a creation request
/// and is filled in as addresses and status become known. It always refers to
/// exactly one physical node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeDescriptor {
    /// Provider assigned identifier.
    pub id: String,
    /// Node name.
    pub name: String,
    /// Private network address, once running.
    pub private_address: Option<IpAddr>,
    /// Public network address, once running.
    pub public_address: Option<IpAddr>,
    /// Credential issued by the provider (inline key material or password).
    #[serde(skip)]
    pub raw_credential: Option<Secret>,
    /// The management agent registered from this node.
    pub agent_running: bool,
    /// The installation payload was staged and bootstrapped.
    pub installed: bool,
}

impl NodeDescriptor {
    /// Creates a descriptor for a node the provider just acknowledged.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            private_address: None,
            public_address: None,
            raw_credential: None,
            agent_running: false,
            installed: false,
        }
    }

    /// Address used to reach the node: the private address when
    /// `use_private` is set, the public one otherwise.
    #[must_use]
    pub const fn connect_address(&self, use_private: bool) -> Option<IpAddr> {
        if use_private {
            self.private_address
        } else {
            self.public_address
        }
    }

    /// Returns `true` once the node is installed and its agent confirmed.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.installed && self.agent_running
    }
}

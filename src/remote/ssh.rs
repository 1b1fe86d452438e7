//! Connection target for the SSH family of helpers.

use std::net::IpAddr;

use crate::installation::{ConnectionSettings, TransferKind};
use crate::node::RemoteCredential;

/// Where and how to reach one node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Remote user name.
    pub user: String,
    /// Address used for every connection.
    pub host: IpAddr,
    /// SSH port.
    pub ssh_port: u16,
    /// SMB port.
    pub share_port: u16,
    /// Key file or password.
    pub credential: RemoteCredential,
}

impl RemoteTarget {
    /// Builds a target from connection settings and a materialised credential.
    #[must_use]
    pub fn new(host: IpAddr, connection: &ConnectionSettings, credential: RemoteCredential) -> Self {
        Self {
            user: connection.username.clone(),
            host,
            ssh_port: connection.ssh_port,
            share_port: connection.share_port,
            credential,
        }
    }

    /// Port relevant to `kind`.
    #[must_use]
    pub const fn port_for(&self, kind: TransferKind) -> u16 {
        match kind {
            TransferKind::Scp | TransferKind::Sftp => self.ssh_port,
            TransferKind::Share => self.share_port,
        }
    }
}

//! Utility functions for path manipulation and remote addressing.

use std::net::IpAddr;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the function returns the
/// input string unchanged (i.e., the leading `~` is not expanded).
///
/// # Examples
///
/// ```
/// # use nodewright::remote::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Host part of an scp style `user@host:path` destination; IPv6 addresses
/// are bracketed.
#[must_use]
pub fn scp_host(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Joins a remote directory and a relative path with `/`.
#[must_use]
pub fn join_remote(dir: &str, relative: &str) -> String {
    let base = dir.trim_end_matches('/');
    if relative.is_empty() {
        return base.to_owned();
    }
    if base.is_empty() {
        return format!("/{relative}");
    }
    format!("{base}/{relative}")
}

//! Shell snippets executed on nodes.
//!
//! Every interpolated value is quoted: POSIX values with
//! `shell_escape::unix::escape`, Windows values inside `"..."`.

use std::borrow::Cow;
use std::collections::BTreeMap;

use shell_escape::unix::escape;

/// Remote shell dialect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShellFlavor {
    /// `sh` compatible shell on Unix-like nodes.
    Posix,
    /// `cmd.exe` behind the Windows OpenSSH server.
    Windows,
}

fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

fn quote_windows(value: &str) -> String {
    format!("\"{}\"", value.replace('"', ""))
}

/// Command that prepares `dir` on a POSIX node.
///
/// With `delete` the directory is removed first so staging starts from an
/// empty tree; otherwise it is only created when absent.
#[must_use]
pub fn prepare_directory_command(dir: &str, delete: bool) -> String {
    let quoted = quote(dir);
    if delete {
        format!("if [ -d {quoted} ]; then rm -rf {quoted}; fi; mkdir -p {quoted}")
    } else {
        format!("if [ ! -d {quoted} ]; then mkdir -p {quoted}; fi")
    }
}

/// Command creating every directory in `dirs` (a single `mkdir -p`).
#[must_use]
pub fn make_directories_command(dirs: &[String]) -> String {
    let quoted = dirs
        .iter()
        .map(|dir| quote(dir).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    format!("mkdir -p {quoted}")
}

/// Command listing every regular file below `dir` as `<size>\t<relative path>`
/// lines. A missing directory yields empty output.
#[must_use]
pub fn inventory_command(dir: &str) -> String {
    let quoted = quote(dir);
    format!("if [ -d {quoted} ]; then cd {quoted} && find . -type f -printf '%s\\t%P\\n'; fi")
}

/// Command exporting `env` and running `script` inside `dir`.
#[must_use]
pub fn bootstrap_command(
    flavor: ShellFlavor,
    dir: &str,
    script: &str,
    env: &BTreeMap<String, String>,
) -> String {
    match flavor {
        ShellFlavor::Posix => {
            let script_path = if script.starts_with('/') {
                script.to_owned()
            } else {
                format!("{}/{script}", dir.trim_end_matches('/'))
            };
            let mut parts = env
                .iter()
                .map(|(key, value)| format!("export {key}={}", quote(value)))
                .collect::<Vec<_>>();
            let quoted_script = quote(&script_path);
            parts.push(format!("cd {}", quote(dir)));
            parts.push(format!("chmod +x {quoted_script}"));
            parts.push(quoted_script.into_owned());
            parts.join("; ")
        }
        ShellFlavor::Windows => {
            let script_path = format!("{}\\{script}", dir.trim_end_matches('\\'));
            let mut parts = env
                .iter()
                .map(|(key, value)| format!("set \"{key}={}\"", value.replace('"', "")))
                .collect::<Vec<_>>();
            parts.push(format!("cd /d {}", quote_windows(dir)));
            parts.push(format!("call {}", quote_windows(&script_path)));
            parts.join(" && ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_with_delete_recreates_directory() {
        assert_eq!(
            prepare_directory_command("/opt/my agent", true),
            "if [ -d '/opt/my agent' ]; then rm -rf '/opt/my agent'; fi; mkdir -p '/opt/my agent'"
        );
    }

    #[test]
    fn prepare_without_delete_only_creates() {
        assert_eq!(
            prepare_directory_command("/opt/agent", false),
            "if [ ! -d /opt/agent ]; then mkdir -p /opt/agent; fi"
        );
    }

    #[test]
    fn posix_bootstrap_exports_then_runs_script() {
        let env = BTreeMap::from([
            (String::from("NODE_ID"), String::from("srv-1")),
            (String::from("WORKING_HOME_DIRECTORY"), String::from("/opt/agent")),
        ]);
        let command = bootstrap_command(ShellFlavor::Posix, "/opt/agent", "start.sh", &env);
        assert_eq!(
            command,
            "export NODE_ID=srv-1; export WORKING_HOME_DIRECTORY=/opt/agent; cd /opt/agent; \
             chmod +x /opt/agent/start.sh; /opt/agent/start.sh"
        );
    }

    #[test]
    fn windows_bootstrap_uses_set_and_call() {
        let env = BTreeMap::from([(String::from("NODE_ID"), String::from("srv-1"))]);
        let command = bootstrap_command(ShellFlavor::Windows, "C:\\agent", "start.bat", &env);
        assert_eq!(
            command,
            "set \"NODE_ID=srv-1\" && cd /d \"C:\\agent\" && call \"C:\\agent\\start.bat\""
        );
    }

    #[test]
    fn inventory_lists_sizes_and_relative_paths() {
        assert_eq!(
            inventory_command("/srv/x"),
            "if [ -d /srv/x ]; then cd /srv/x && find . -type f -printf '%s\\t%P\\n'; fi"
        );
    }
}

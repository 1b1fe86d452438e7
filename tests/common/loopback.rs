//! Command runner that plays the remote node on the local machine.
//!
//! `ssh` runs its remote command with the local `sh`, while `scp` and `sftp`
//! copy into the local file system. Remote paths are therefore local paths,
//! so tests point the remote directory into a temporary directory.
//!
//! Include it from an integration test with:
//!
//! ```rust
//! #[path = "common/loopback.rs"]
//! mod loopback;
//! ```

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nodewright::remote::{
    CommandFuture, CommandOutput, CommandRunner, Invocation, ProcessCommandRunner,
};

/// Records the helper programs it was asked to run and emulates them locally.
#[derive(Clone, Debug, Default)]
pub struct LoopbackRunner {
    programs: Arc<Mutex<Vec<String>>>,
}

impl LoopbackRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations of `program` so far.
    pub fn count(&self, program: &str) -> usize {
        self.programs
            .lock()
            .expect("programs lock")
            .iter()
            .filter(|seen| *seen == program)
            .count()
    }
}

impl CommandRunner for LoopbackRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> CommandFuture<'a> {
        Box::pin(async move {
            self.programs
                .lock()
                .expect("programs lock")
                .push(invocation.program.clone());
            match invocation.program.as_str() {
                "ssh" => {
                    let command = invocation.args.last().cloned().unwrap_or_default();
                    let local = Invocation::new("sh", vec![OsString::from("-c"), command])
                        .with_timeout(invocation.timeout);
                    ProcessCommandRunner.run(&local).await
                }
                "scp" => Ok(copy_files(&invocation.args)),
                "sftp" => Ok(run_batch(&invocation.args)),
                other => Ok(failed(format!("{other} is not emulated"))),
            }
        })
    }
}

fn succeeded() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        ..CommandOutput::default()
    }
}

fn failed(message: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: message.into(),
    }
}

/// `scp [options] -p <sources..> user@host:<dir>/`
fn copy_files(args: &[OsString]) -> CommandOutput {
    let Some(preserve) = args.iter().rposition(|arg| arg == "-p") else {
        return failed("scp: missing -p");
    };
    let Some((last, sources)) = args[preserve + 1..].split_last() else {
        return failed("scp: missing destination");
    };
    let destination = last.to_string_lossy();
    let Some((_, dir)) = destination.split_once(':') else {
        return failed(format!("scp: malformed destination {destination}"));
    };
    for source in sources.iter().map(Path::new) {
        let Some(name) = source.file_name() else {
            return failed(format!("scp: {} has no file name", source.display()));
        };
        if let Err(err) = place(source, &Path::new(dir).join(name)) {
            return failed(format!("scp: {}: {err}", source.display()));
        }
    }
    succeeded()
}

/// `sftp -b <batch> [options] user@host`
fn run_batch(args: &[OsString]) -> CommandOutput {
    let Some(batch) = args.get(1) else {
        return failed("sftp: missing batch file");
    };
    let Ok(script) = fs::read_to_string(batch) else {
        return failed("sftp: unreadable batch file");
    };
    for line in script.lines() {
        let Some((command, rest)) = line.split_once(' ') else {
            continue;
        };
        let operands = quoted_operands(rest);
        match (command, operands.as_slice()) {
            ("-mkdir", [dir]) => {
                fs::create_dir_all(dir).ok();
            }
            ("put", [source, target]) => {
                if let Err(err) = place(Path::new(source), Path::new(target)) {
                    return failed(format!("sftp: put {source}: {err}"));
                }
            }
            _ => return failed(format!("sftp: unsupported batch line {line}")),
        }
    }
    succeeded()
}

/// Copies next to `target` and renames over it, so a script another node is
/// executing is replaced rather than rewritten in place.
fn place(source: &Path, target: &Path) -> io::Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    fs::copy(source, &partial)?;
    fs::rename(&partial, target)
}

fn quoted_operands(rest: &str) -> Vec<String> {
    let mut operands = Vec::new();
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        if ch != '"' {
            continue;
        }
        let mut value = String::new();
        while let Some(inner) = chars.next() {
            match inner {
                '\\' => value.extend(chars.next()),
                '"' => break,
                other => value.push(other),
            }
        }
        operands.push(value);
    }
    operands
}

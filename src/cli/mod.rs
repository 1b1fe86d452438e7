//! Command-line interface definitions for the `nodewright` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::net::IpAddr;

use clap::{Parser, Subcommand};

/// Top-level CLI for the `nodewright` binary.
#[derive(Debug, Parser)]
#[command(
    name = "nodewright",
    about = "Provision cloud nodes, stage an installation payload, and confirm their agents",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log line format: `text` or `json`.
    #[arg(long, global = true, value_name = "FORMAT", default_value = "text")]
    pub(crate) log_format: String,
    /// Log filter directives, for example `info` or `nodewright=debug`.
    #[arg(long, global = true, value_name = "FILTER", env = "RUST_LOG", default_value = "info")]
    pub(crate) log_level: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `nodewright` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision one node and print its descriptor as JSON.
    #[command(name = "provision")]
    Provision(ProvisionCommand),
    /// Provision a fleet of nodes that succeed or fail together.
    #[command(name = "fleet")]
    Fleet(FleetCommand),
    /// Request termination of the node owning an address.
    ///
    /// Repeated requests are only suppressed within one running process, so
    /// every invocation of this command dispatches its request.
    #[command(name = "stop")]
    Stop(StopCommand),
    /// Terminate every node carrying the configured name prefix.
    #[command(name = "teardown")]
    Teardown(TeardownCommand),
}

/// Arguments for `nodewright provision`.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Overall budget in seconds; defaults to the configured timeout.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for `nodewright fleet`.
#[derive(Debug, Parser)]
pub(crate) struct FleetCommand {
    /// Number of nodes; defaults to the configured fleet size.
    #[arg(long, value_name = "N")]
    pub(crate) count: Option<usize>,
    /// Overall budget in seconds; defaults to the configured timeout.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for `nodewright stop`.
#[derive(Debug, Parser)]
pub(crate) struct StopCommand {
    /// Public or private address of the node to stop.
    #[arg(value_name = "ADDRESS")]
    pub(crate) address: IpAddr,
}

/// Arguments for `nodewright teardown`.
#[derive(Debug, Parser)]
pub(crate) struct TeardownCommand {
    /// Name prefix to tear down; defaults to the configured prefix.
    #[arg(long, value_name = "PREFIX")]
    pub(crate) prefix: Option<String>,
}

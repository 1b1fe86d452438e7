//! Binary entry point for the Nodewright CLI.

use std::io::{self, Write};
use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;

use nodewright::logging::{self, LogFormat, LoggerError, LoggingConfig};
use nodewright::{
    AgentSignal, ConfigError, FleetProvisioner, NodeDescriptor, NodeFailure, NodeProvisioner,
    PortProbeSignal, ProcessCommandRunner, ProvisionError, ProvisioningConfig,
    ProvisioningListener, RemoteAccessConfig, RemoteExecutor, RemoteInstaller,
    ScaleInDeduplicator, ScalewayConfig, ScalewayProvider, ScalewayProviderError,
    TracingListener,
};

mod cli;

use cli::{Cli, Command, FleetCommand, ProvisionCommand, StopCommand, TeardownCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggerError),
    #[error(transparent)]
    Provider(#[from] ScalewayProviderError),
    #[error(transparent)]
    Node(#[from] NodeFailure),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("failed to write output: {0}")]
    Output(String),
}

type Provisioner = NodeProvisioner<ScalewayProvider, ProcessCommandRunner>;

#[derive(Serialize)]
struct StopReport {
    address: IpAddr,
    dispatched: bool,
}

#[derive(Serialize)]
struct TeardownReport {
    prefix: String,
    terminated: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&LoggingConfig {
        format: cli.log_format.parse::<LogFormat>()?,
        level: cli.log_level,
        with_targets: false,
    })?;
    dispatch(cli.command).await
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Provision(args) => provision(args).await,
        Command::Fleet(args) => fleet(args).await,
        Command::Stop(args) => stop(args).await,
        Command::Teardown(args) => teardown(args).await,
    }
}

async fn provision(args: ProvisionCommand) -> Result<(), CliError> {
    let settings = ProvisioningConfig::load_without_cli_args()?;
    let spec = settings.to_spec()?;
    let timeout = args
        .timeout
        .map_or_else(|| settings.timeout(), Duration::from_secs);
    let node = provisioner(&settings)?.provision_node(&spec, timeout).await?;
    write_json(&node)
}

async fn fleet(args: FleetCommand) -> Result<(), CliError> {
    let settings = ProvisioningConfig::load_without_cli_args()?;
    let spec = settings.to_spec()?;
    let count = args.count.unwrap_or(settings.fleet_size);
    let timeout = args
        .timeout
        .map_or_else(|| settings.timeout(), Duration::from_secs);
    let nodes: Vec<NodeDescriptor> = FleetProvisioner::new(provisioner(&settings)?)
        .provision_fleet(&spec, count, timeout)
        .await?;
    write_json(&nodes)
}

async fn stop(args: StopCommand) -> Result<(), CliError> {
    let dedup = ScaleInDeduplicator::new(Arc::new(scaleway()?));
    let dispatched = dedup.request_stop(args.address).await?;
    write_json(&StopReport {
        address: args.address,
        dispatched,
    })
}

async fn teardown(args: TeardownCommand) -> Result<(), CliError> {
    let settings = ProvisioningConfig::load_without_cli_args()?;
    let prefix = args.prefix.unwrap_or_else(|| settings.name_prefix.clone());
    let provider = Arc::new(scaleway()?);
    let installer = installer(&settings)?;
    let nodes = NodeProvisioner::new(provider, installer, Arc::new(TracingListener));
    let terminated = FleetProvisioner::new(nodes).teardown_fleet(&prefix).await?;
    write_json(&TeardownReport { prefix, terminated })
}

fn scaleway() -> Result<ScalewayProvider, CliError> {
    let config = ScalewayConfig::load_without_cli_args()?;
    Ok(ScalewayProvider::new(config)?)
}

fn installer(settings: &ProvisioningConfig) -> Result<RemoteInstaller<ProcessCommandRunner>, CliError> {
    let remote = RemoteExecutor::with_process_runner(RemoteAccessConfig::load_without_cli_args()?)?;
    let listener: Arc<dyn ProvisioningListener> = Arc::new(TracingListener);
    let agent: Arc<dyn AgentSignal> = Arc::new(PortProbeSignal::new(settings.agent_port));
    Ok(RemoteInstaller::new(remote, agent, listener, settings.timings()))
}

fn provisioner(settings: &ProvisioningConfig) -> Result<Provisioner, CliError> {
    Ok(NodeProvisioner::new(
        Arc::new(scaleway()?),
        installer(settings)?,
        Arc::new(TracingListener),
    )
    .with_poll_interval(settings.status_poll_interval()))
}

fn write_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)
        .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(stdout).map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        writeln!(target, "  caused by: {cause}").ok();
        source = cause.source();
    }
}

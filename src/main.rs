//! Binary entry point for the devnet CLI.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devnet::{
    ConfigError, Credential, CredentialError, DeployError, Deployment, DevnetConfig,
    DirectoryError, Fleet, FleetConfigError, OpenSshConnector, Passphrase, PreparedFleet, ProcessCommandRunner,
    SessionError, SessionManager, bootstrap, public_addresses,
};

mod cli;

use cli::{Cli, FleetCommand, NewConfigCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fleet error: {0}")]
    Fleet(#[from] FleetConfigError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Deploy(#[from] DeployError),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("refusing to overwrite {0}; pass --force to replace it")]
    Exists(Utf8PathBuf),
    #[error("failed to read passphrase: {0}")]
    Prompt(String),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Init(args) => init_command(args).await,
        Cli::NewConfig(args) => new_config_command(&args),
        Cli::Addresses(args) => addresses_command(args).await,
    }
}

async fn init_command(args: FleetCommand) -> Result<(), CliError> {
    let (config, prepared) = prepare(args).await?;

    let passphrase = config
        .passphrase()
        .map_or_else(|| prompt_passphrase(&config.key_path()), Ok)?;
    let credential = Credential::from_file(&config.key_path(), &passphrase)?;
    info!(family = %credential.family(), "loaded SSH credential");

    let connector =
        OpenSshConnector::new(&credential, config.ssh_settings(), ProcessCommandRunner)?;
    let report = bootstrap(&prepared.fleet, &SessionManager::new(connector)).await?;

    let mut stdout = io::stdout();
    for host in &report.fanout.hosts {
        writeln!(
            stdout,
            "{}: payload {}, {}/{} commands succeeded",
            host.node,
            if host.delivered { "delivered" } else { "failed" },
            host.commands_run - host.commands_failed,
            host.commands_run
        )
        .ok();
    }
    for failure in &report.fanout.failures {
        writeln!(stdout, "failure: {failure}").ok();
    }
    Ok(())
}

async fn addresses_command(args: FleetCommand) -> Result<(), CliError> {
    let (_config, prepared) = prepare(args).await?;
    let addresses = public_addresses(&prepared.fleet).map_err(DeployError::from)?;

    let mut stdout = io::stdout();
    for (node, address) in &addresses {
        writeln!(stdout, "{node} {address}").ok();
    }
    for path in &prepared.artifacts {
        writeln!(stdout, "wrote {path}").ok();
    }
    Ok(())
}

async fn prepare(args: FleetCommand) -> Result<(DevnetConfig, PreparedFleet), CliError> {
    let config = DevnetConfig::load_without_cli_args()?;
    config.validate()?;
    let fleet = Fleet::load(&utf8_path(args.fleet)?)?;
    let prepared = Deployment::new(config.directory()?).prepare(&fleet).await?;
    Ok((config, prepared))
}

fn new_config_command(args: &NewConfigCommand) -> Result<(), CliError> {
    let path = utf8_path(args.path.clone())?;
    write_starter_fleet(&path, args.force)?;
    writeln!(io::stdout(), "wrote starter fleet to {path}").ok();
    Ok(())
}

fn write_starter_fleet(path: &Utf8Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Exists(path.to_path_buf()));
    }
    Fleet::example().write(path)?;
    Ok(())
}

fn prompt_passphrase(key_path: &Utf8Path) -> Result<Passphrase, CliError> {
    let mut stderr = io::stderr();
    write!(stderr, "Passphrase for {key_path} (`nil` to skip): ").ok();
    stderr.flush().ok();

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| CliError::Prompt(err.to_string()))?;
    Ok(Passphrase::from_input(line.trim_end_matches(['\r', '\n'])))
}

fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|raw| CliError::NonUtf8Path(raw.display().to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

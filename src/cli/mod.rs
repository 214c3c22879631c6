//! Command-line interface definitions for the `devnet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::Parser;

/// Default fleet description path.
pub(crate) const DEFAULT_FLEET_PATH: &str = "config.json";

/// Top-level CLI for the `devnet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "devnet",
    about = "Reconcile a declared test-network fleet with live droplets and bootstrap it over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Bind the fleet, write address artifacts, and bootstrap every node.
    #[command(
        name = "init",
        about = "Bind the fleet, write address artifacts, and bootstrap every node"
    )]
    Init(FleetCommand),
    /// Write a starter fleet description.
    #[command(name = "new-config", about = "Write a starter fleet description")]
    NewConfig(NewConfigCommand),
    /// Bind the fleet and write address artifacts without connecting.
    #[command(
        name = "addresses",
        about = "Bind the fleet and write address artifacts without connecting"
    )]
    Addresses(FleetCommand),
}

/// Arguments for subcommands that operate on a fleet description.
#[derive(Debug, Parser)]
pub(crate) struct FleetCommand {
    /// Fleet description (JSON).
    #[arg(value_name = "FLEET", default_value = DEFAULT_FLEET_PATH)]
    pub(crate) fleet: PathBuf,
}

/// Arguments for the `devnet new-config` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct NewConfigCommand {
    /// Destination for the starter fleet description.
    #[arg(value_name = "PATH", default_value = DEFAULT_FLEET_PATH)]
    pub(crate) path: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    pub(crate) force: bool,
}

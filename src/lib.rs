//! Core library for the devnet fleet bootstrap tool.
//!
//! A declared fleet of named nodes is reconciled against the live droplets
//! carrying the fleet tag, address artifacts are written into every payload
//! directory, and one authenticated SSH session per bound node delivers the
//! payload and runs the node's bootstrap commands concurrently. Per-host
//! failures are isolated and reported; setup failures abort the run after
//! closing anything already opened.

pub mod artifacts;
pub mod config;
pub mod credential;
pub mod deploy;
pub mod directory;
pub mod exec;
pub mod fanout;
pub mod fleet;
pub mod reconcile;
pub mod session;
pub mod test_support;

pub use artifacts::{
    ArtifactError, JSON_ARTIFACT, SHELL_ARTIFACT, public_addresses, write_address_artifacts,
};
pub use config::{ConfigError, DevnetConfig};
pub use credential::{Credential, CredentialError, KeyFamily, Passphrase, SKIP_SENTINEL};
pub use deploy::{BootstrapReport, DeployError, Deployment, PreparedFleet, bootstrap};
pub use directory::{
    DigitalOceanDirectory, DirectoryError, Instance, InstanceDirectory, InstancePage,
    filter_by_tag, list_instances,
};
pub use exec::{CommandOutput, CommandRunner, ExecError, OutputSink, ProcessCommandRunner};
pub use fanout::{FanoutReport, HostFailure, HostReport, deliver_and_run};
pub use fleet::{Fleet, FleetConfigError, FleetNode, NodeRole};
pub use reconcile::{BindError, ReconciliationError, Reconciler, reconcile};
pub use session::{
    Connection, Connector, OpenSshConnector, RemoteSession, SessionError, SessionManager,
    SessionPool, SshSettings, TeardownReport, TransportError,
};

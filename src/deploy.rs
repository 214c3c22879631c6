//! Orchestrates a full bootstrap run over a declared fleet.
//!
//! The run binds the fleet against the live directory, writes the address
//! artifacts into every payload directory, opens one session per bound node,
//! fans delivery and bootstrap commands out across the pool, and tears every
//! session down again. Setup failures abort the run; per-host failures are
//! reported in the outcome and leave the run successful.

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::{ArtifactError, write_address_artifacts};
use crate::directory::InstanceDirectory;
use crate::fanout::{FanoutReport, deliver_and_run};
use crate::fleet::{Fleet, FleetConfigError};
use crate::reconcile::{BindError, Reconciler};
use crate::session::{Connector, SessionError, SessionManager, TeardownReport};

/// Fatal errors that abort a run before or during session setup.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Raised when the fleet description is invalid.
    #[error(transparent)]
    Fleet(#[from] FleetConfigError),
    /// Raised when listing or reconciling live instances fails.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// Raised when address artifacts cannot be written.
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),
    /// Raised when the session pool cannot be opened.
    #[error(transparent)]
    Sessions(#[from] SessionError),
}

/// Bound fleet plus the artifacts written for it.
#[derive(Clone, Debug)]
pub struct PreparedFleet {
    /// Fleet with every matched node bound to its instance.
    pub fleet: Fleet,
    /// Artifact files written, in payload-directory order.
    pub artifacts: Vec<Utf8PathBuf>,
}

/// Result of [`bootstrap`].
#[derive(Debug)]
pub struct BootstrapReport {
    /// Per-host delivery and command results.
    pub fanout: FanoutReport,
    /// Session teardown results.
    pub teardown: TeardownReport,
}

impl BootstrapReport {
    /// Returns `true` when no host and no teardown step failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fanout.is_clean() && self.teardown.is_clean()
    }
}

/// Binds fleets against an instance directory.
#[derive(Debug)]
pub struct Deployment<D> {
    reconciler: Reconciler<D>,
}

impl<D: InstanceDirectory> Deployment<D> {
    /// Creates a deployment reading live instances from `directory`.
    pub const fn new(directory: D) -> Self {
        Self {
            reconciler: Reconciler::new(directory),
        }
    }

    /// Validates and binds `fleet`, then writes its address artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Fleet`] for an invalid fleet,
    /// [`DeployError::Bind`] when listing or reconciliation fails, and
    /// [`DeployError::Artifacts`] when the artifacts cannot be written.
    pub async fn prepare(&self, fleet: &Fleet) -> Result<PreparedFleet, DeployError> {
        fleet.validate()?;
        let bound = self.reconciler.bind(fleet).await?;
        let artifacts = write_address_artifacts(&bound)?;
        Ok(PreparedFleet {
            fleet: bound,
            artifacts,
        })
    }
}

/// Opens sessions to every bound node, runs the fan-out, and tears down.
///
/// Teardown always runs once the pool is open; its failures are reported in
/// the returned [`BootstrapReport`].
///
/// # Errors
///
/// Returns [`DeployError::Sessions`] when the pool cannot be opened. Any
/// sessions opened before the failure have already been closed.
pub async fn bootstrap<K: Connector>(
    fleet: &Fleet,
    sessions: &SessionManager<K>,
) -> Result<BootstrapReport, DeployError> {
    let pool = sessions.open_all(fleet)?;
    let (mut pool, fanout) = deliver_and_run(pool).await;
    let teardown = sessions.close_all(&mut pool);
    if !teardown.is_clean() {
        warn!(failures = teardown.failures.len(), "session teardown reported failures");
    }
    info!(
        hosts = fanout.hosts.len(),
        host_failures = fanout.failures.len(),
        closed = teardown.closed,
        "bootstrap finished"
    );
    Ok(BootstrapReport { fanout, teardown })
}

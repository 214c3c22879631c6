//! Concurrent payload delivery and bootstrap across an open session pool.
//!
//! Each session gets exactly one worker. Inside a worker the payload is
//! delivered first and the node's bootstrap commands then run in declared
//! order. Failures are reported per host as they happen and never stop
//! another host or the remaining commands of the same host.

use thiserror::Error;
use tracing::info;

use crate::session::{Connection, RemoteSession, SessionError, SessionPool};

mod task_group;

pub use task_group::{FailureSender, JoinedGroup, TaskGroup};

/// A failure confined to a single host.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum HostFailure {
    /// Delivery or a command failed on the host.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The host's worker stopped before finishing.
    #[error("worker for {node} stopped unexpectedly: {message}")]
    WorkerLost {
        /// Node name.
        node: String,
        /// Panic message or join error.
        message: String,
    },
}

impl HostFailure {
    /// Node the failure belongs to.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Session(err) => err.node(),
            Self::WorkerLost { node, .. } => Some(node),
        }
    }
}

/// What one worker did on its host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostReport {
    /// Node name.
    pub node: String,
    /// Whether the payload reached the host.
    pub delivered: bool,
    /// Commands attempted, in order.
    pub commands_run: usize,
    /// Commands that failed.
    pub commands_failed: usize,
}

impl HostReport {
    /// Returns `true` when delivery and every command succeeded.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.delivered && self.commands_failed == 0
    }
}

/// Outcome of [`deliver_and_run`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FanoutReport {
    /// Hosts whose worker finished, ordered by node name.
    pub hosts: Vec<HostReport>,
    /// Every per-host failure, in the order reported.
    pub failures: Vec<HostFailure>,
}

impl FanoutReport {
    /// Returns `true` when no host reported a failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures reported for `node`.
    pub fn failures_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a HostFailure> {
        self.failures
            .iter()
            .filter(move |failure| failure.node() == Some(node))
    }

    /// Report for `node`, when its worker finished.
    #[must_use]
    pub fn host(&self, node: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|host| host.node == node)
    }
}

/// Delivers payloads and runs bootstrap commands on every session at once.
///
/// Waits for all workers before returning. The sessions are handed back for
/// teardown; a session whose worker panicked has already been closed by its
/// drop and is absent from the returned pool.
pub async fn deliver_and_run<C: Connection>(
    pool: SessionPool<C>,
) -> (SessionPool<C>, FanoutReport) {
    let mut group = TaskGroup::new();
    for mut session in pool.into_sessions() {
        let node = session.node().name.clone();
        group.spawn_blocking(node, move |failures| {
            let report = run_host(&mut session, failures);
            (session, report)
        });
    }
    info!(hosts = group.len(), "fan-out started");

    let joined = group.join().await;
    let (sessions, mut hosts): (Vec<_>, Vec<_>) = joined.outputs.into_iter().unzip();
    hosts.sort_by(|left, right| left.node.cmp(&right.node));
    let report = FanoutReport {
        hosts,
        failures: joined.failures,
    };
    info!(
        hosts = report.hosts.len(),
        failures = report.failures.len(),
        "fan-out finished"
    );
    (sessions.into_iter().collect(), report)
}

fn run_host<C: Connection>(session: &mut RemoteSession<C>, failures: &FailureSender) -> HostReport {
    let node = session.node().name.clone();
    info!(node = %node, payload = %session.node().payload_path, "delivering payload");
    let delivered = match session.deliver_payload() {
        Ok(()) => true,
        Err(err) => {
            failures.report(err.into());
            false
        }
    };

    let commands = session.node().bootstrap_commands.clone();
    let mut commands_failed = 0;
    for command in &commands {
        info!(node = %node, command = %command, "running command");
        if let Err(err) = session.run_command(command) {
            commands_failed += 1;
            failures.report(err.into());
        }
    }

    HostReport {
        node,
        delivered,
        commands_run: commands.len(),
        commands_failed,
    }
}

#[cfg(test)]
mod tests;

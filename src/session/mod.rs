//! Authenticated remote sessions, one per bound fleet node.
//!
//! [`SessionManager::open_all`] opens a connection and an append-mode output
//! file for every bound node. Opening is all-or-nothing: when any node fails,
//! the sessions already opened are closed before the error is returned.
//! [`SessionManager::close_all`] tears the pool down, continuing past
//! individual failures and reporting every one of them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::directory::DirectoryError;
use crate::exec::OutputSink;
use crate::fleet::{Fleet, FleetNode};

mod openssh;

pub use openssh::{
    DEFAULT_REMOTE_PAYLOAD_ROOT, OpenSshConnection, OpenSshConnector, SshSettings,
};

/// Failure reported by a transport implementation.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Creates a transport error with a human-readable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An open, authenticated connection to one host.
///
/// Implementations must tolerate `close` being called more than once.
pub trait Connection: Send + 'static {
    /// Recursively copies `payload` to the transport's remote payload root.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the copy fails.
    fn deliver(&mut self, payload: &Utf8Path) -> Result<(), TransportError>;

    /// Runs `command` on the host, appending combined output to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the command cannot run or exits
    /// non-zero.
    fn execute(&mut self, command: &str, sink: &mut OutputSink) -> Result<(), TransportError>;

    /// Releases the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transport reports a failure.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens connections to fleet nodes.
pub trait Connector {
    /// Connection type produced by this connector.
    type Connection: Connection;

    /// Opens an authenticated connection to `node` at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection cannot be established.
    fn connect(
        &self,
        node: &FleetNode,
        address: IpAddr,
    ) -> Result<Self::Connection, TransportError>;
}

/// Errors raised by session management.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when a bound instance has no public address.
    #[error("node {node} has no reachable address: {source}")]
    MissingAddress {
        /// Node name.
        node: String,
        /// Directory error describing the instance.
        source: DirectoryError,
    },
    /// Raised when the per-node output file cannot be opened.
    #[error("failed to open output file {path} for {node}: {message}")]
    OutputSink {
        /// Node name.
        node: String,
        /// Output file path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the SSH identity cannot be prepared.
    #[error("failed to prepare SSH identity: {message}")]
    Identity {
        /// Underlying error message.
        message: String,
    },
    /// Raised when connecting to a node fails.
    #[error("failed to connect to {node} ({address}): {message}")]
    Connect {
        /// Node name.
        node: String,
        /// Address dialled.
        address: IpAddr,
        /// Transport error message.
        message: String,
    },
    /// Raised when payload delivery fails.
    #[error("failed to deliver payload {payload} to {node}: {message}")]
    Delivery {
        /// Node name.
        node: String,
        /// Local payload directory.
        payload: Utf8PathBuf,
        /// Transport error message.
        message: String,
    },
    /// Raised when a bootstrap command fails.
    #[error("command `{command}` failed on {node}: {message}")]
    Command {
        /// Node name.
        node: String,
        /// Command as declared in the fleet.
        command: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when closing the connection fails.
    #[error("failed to close connection to {node}: {message}")]
    CloseConnection {
        /// Node name.
        node: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when closing the output file fails.
    #[error("failed to close output file {path} for {node}: {message}")]
    CloseSink {
        /// Node name.
        node: String,
        /// Output file path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl SessionError {
    /// Node the failure belongs to, when it is tied to one.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::MissingAddress { node, .. }
            | Self::OutputSink { node, .. }
            | Self::Connect { node, .. }
            | Self::Delivery { node, .. }
            | Self::Command { node, .. }
            | Self::CloseConnection { node, .. }
            | Self::CloseSink { node, .. } => Some(node),
            Self::Identity { .. } => None,
        }
    }
}

/// A fleet node paired with its connection and output file.
pub struct RemoteSession<C: Connection> {
    node: FleetNode,
    address: IpAddr,
    connection: C,
    sink: OutputSink,
    closed: bool,
}

impl<C: Connection> RemoteSession<C> {
    /// Pairs an open connection with the node's output sink.
    pub fn new(node: FleetNode, address: IpAddr, connection: C, sink: OutputSink) -> Self {
        Self {
            node,
            address,
            connection,
            sink,
            closed: false,
        }
    }

    /// Node served by this session.
    pub const fn node(&self) -> &FleetNode {
        &self.node
    }

    /// Address the connection was opened against.
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Returns `true` once [`RemoteSession::close`] has run.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Copies the node's payload directory to the host.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Delivery`] when the transfer fails.
    pub fn deliver_payload(&mut self) -> Result<(), SessionError> {
        self.connection
            .deliver(self.node.payload_path())
            .map_err(|err| SessionError::Delivery {
                node: self.node.name.clone(),
                payload: self.node.payload_path.clone(),
                message: err.message,
            })
    }

    /// Runs one command, appending its output to the node's sink.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Command`] when the command fails.
    pub fn run_command(&mut self, command: &str) -> Result<(), SessionError> {
        self.connection
            .execute(command, &mut self.sink)
            .map_err(|err| SessionError::Command {
                node: self.node.name.clone(),
                command: command.to_owned(),
                message: err.message,
            })
    }

    /// Closes the connection and then the output sink.
    ///
    /// Both steps are attempted; the failures are returned. Later calls do
    /// nothing and return no failures.
    pub fn close(&mut self) -> Vec<SessionError> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let mut failures = Vec::new();
        if let Err(err) = self.connection.close() {
            failures.push(SessionError::CloseConnection {
                node: self.node.name.clone(),
                message: err.message,
            });
        }
        if let Err(err) = self.sink.close() {
            failures.push(SessionError::CloseSink {
                node: self.node.name.clone(),
                path: self.sink.path().to_path_buf(),
                message: err.to_string(),
            });
        }
        failures
    }
}

impl<C: Connection> fmt::Debug for RemoteSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("node", &self.node.name)
            .field("address", &self.address)
            .field("sink", &self.sink.path())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Drop for RemoteSession<C> {
    fn drop(&mut self) {
        for failure in self.close() {
            warn!(node = %self.node.name, error = %failure, "session teardown failed on drop");
        }
    }
}

/// Open sessions keyed by node name.
#[derive(Debug)]
pub struct SessionPool<C: Connection> {
    sessions: BTreeMap<String, RemoteSession<C>>,
}

impl<C: Connection> Default for SessionPool<C> {
    fn default() -> Self {
        Self {
            sessions: BTreeMap::new(),
        }
    }
}

impl<C: Connection> SessionPool<C> {
    /// Number of sessions in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` when the pool holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Node names in the pool, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    /// Looks up the session for `node`.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&RemoteSession<C>> {
        self.sessions.get(node)
    }

    /// Number of sessions not yet closed.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_closed()).count()
    }

    pub(crate) fn insert(&mut self, session: RemoteSession<C>) {
        self.sessions.insert(session.node.name.clone(), session);
    }

    pub(crate) fn into_sessions(self) -> impl Iterator<Item = RemoteSession<C>> {
        self.sessions.into_values()
    }
}

impl<C: Connection> FromIterator<RemoteSession<C>> for SessionPool<C> {
    fn from_iter<I: IntoIterator<Item = RemoteSession<C>>>(iter: I) -> Self {
        let mut pool = Self::default();
        for session in iter {
            pool.insert(session);
        }
        pool
    }
}

/// Outcome of [`SessionManager::close_all`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Sessions closed by this call.
    pub closed: usize,
    /// Every failure encountered while closing.
    pub failures: Vec<SessionError>,
}

impl TeardownReport {
    /// Returns `true` when nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Opens and tears down the session pool.
#[derive(Debug)]
pub struct SessionManager<K> {
    connector: K,
}

impl<K: Connector> SessionManager<K> {
    /// Creates a manager that dials through `connector`.
    pub const fn new(connector: K) -> Self {
        Self { connector }
    }

    /// Borrow the connector.
    pub const fn connector(&self) -> &K {
        &self.connector
    }

    /// Opens one session per bound node, in node-name order.
    ///
    /// # Errors
    ///
    /// Returns the first [`SessionError::MissingAddress`],
    /// [`SessionError::OutputSink`], or [`SessionError::Connect`]
    /// encountered. Sessions opened before the failure are closed first.
    pub fn open_all(&self, fleet: &Fleet) -> Result<SessionPool<K::Connection>, SessionError> {
        let mut pool = SessionPool::default();
        for node in fleet.bound_nodes() {
            match self.open_session(node) {
                Ok(session) => pool.insert(session),
                Err(err) => {
                    let report = self.close_all(&mut pool);
                    warn!(
                        node = %node.name,
                        error = %err,
                        closed = report.closed,
                        "aborting session setup"
                    );
                    return Err(err);
                }
            }
        }
        info!(sessions = pool.len(), "opened remote sessions");
        Ok(pool)
    }

    fn open_session(&self, node: &FleetNode) -> Result<RemoteSession<K::Connection>, SessionError> {
        let address = node
            .bound_instance()
            .ok_or_else(|| SessionError::MissingAddress {
                node: node.name.clone(),
                source: DirectoryError::MissingPublicAddress {
                    instance: node.name.clone(),
                },
            })?
            .public_address()
            .map_err(|source| SessionError::MissingAddress {
                node: node.name.clone(),
                source,
            })?;

        let sink = OutputSink::open_append(&node.output_path).map_err(|err| {
            SessionError::OutputSink {
                node: node.name.clone(),
                path: node.output_path.clone(),
                message: err.to_string(),
            }
        })?;

        let connection = self
            .connector
            .connect(node, address)
            .map_err(|err| SessionError::Connect {
                node: node.name.clone(),
                address,
                message: err.message,
            })?;
        info!(node = %node.name, %address, "session open");
        Ok(RemoteSession::new(node.clone(), address, connection, sink))
    }

    /// Closes every session in the pool, continuing past failures.
    ///
    /// Sessions that are already closed are skipped, so calling this twice
    /// is harmless.
    pub fn close_all(&self, pool: &mut SessionPool<K::Connection>) -> TeardownReport {
        let mut report = TeardownReport::default();
        for session in pool.sessions.values_mut() {
            if session.is_closed() {
                continue;
            }
            let failures = session.close();
            for failure in &failures {
                warn!(node = %session.node.name, error = %failure, "teardown failure");
            }
            report.closed += 1;
            report.failures.extend(failures);
        }
        report
    }
}

#[cfg(test)]
mod tests;

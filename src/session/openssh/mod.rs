//! OpenSSH transport built on connection multiplexing.
//!
//! Each node gets one master connection (`ssh -M`) bound to a control socket
//! in a private temporary directory. Commands and `scp` transfers reuse that
//! socket, so authentication happens exactly once per node. The decrypted
//! identity lives in a `0600` temporary file for as long as the connector
//! exists.

use std::ffi::OsString;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;
use zeroize::Zeroizing;

use super::{Connection, Connector, SessionError, TransportError};
use crate::credential::Credential;
use crate::exec::{CommandRunner, OutputSink, status_text};
use crate::fleet::FleetNode;

/// Default remote directory payloads are copied into.
pub const DEFAULT_REMOTE_PAYLOAD_ROOT: &str = "/root/";

/// Connection parameters shared by every node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Remote login user.
    pub user: String,
    /// Remote SSH port.
    pub port: u16,
    /// OpenSSH client binary.
    pub ssh_bin: String,
    /// Secure copy binary.
    pub scp_bin: String,
    /// Remote directory receiving payloads.
    pub remote_payload_root: String,
    /// Seconds allowed for the initial TCP connect and handshake.
    pub connect_timeout_secs: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: String::from("root"),
            port: 22,
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            remote_payload_root: String::from(DEFAULT_REMOTE_PAYLOAD_ROOT),
            connect_timeout_secs: 15,
        }
    }
}

struct ConnectorShared {
    settings: SshSettings,
    identity: NamedTempFile,
    control_dir: TempDir,
}

/// Opens multiplexed OpenSSH connections authenticated with one credential.
#[derive(Clone)]
pub struct OpenSshConnector<R> {
    runner: R,
    shared: Arc<ConnectorShared>,
}

impl<R> std::fmt::Debug for OpenSshConnector<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSshConnector")
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner + Clone + Send + 'static> OpenSshConnector<R> {
    /// Writes the credential's identity to a private temporary file and
    /// prepares the control socket directory.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Identity`] when either temporary resource
    /// cannot be created.
    pub fn new(
        credential: &Credential,
        settings: SshSettings,
        runner: R,
    ) -> Result<Self, SessionError> {
        let identity_error = |err: std::io::Error| SessionError::Identity {
            message: err.to_string(),
        };
        let mut identity = tempfile::Builder::new()
            .prefix("devnet-identity-")
            .tempfile()
            .map_err(identity_error)?;
        let pem: Zeroizing<String> = credential.identity_pem();
        identity
            .write_all(pem.as_bytes())
            .and_then(|()| identity.flush())
            .map_err(identity_error)?;
        let control_dir = tempfile::Builder::new()
            .prefix("devnet-ctl-")
            .tempdir()
            .map_err(identity_error)?;

        Ok(Self {
            runner,
            shared: Arc::new(ConnectorShared {
                settings,
                identity,
                control_dir,
            }),
        })
    }

    /// Settings applied to every connection.
    #[must_use]
    pub fn settings(&self) -> &SshSettings {
        &self.shared.settings
    }

    /// Path of the temporary identity file.
    #[must_use]
    pub fn identity_path(&self) -> &Path {
        self.shared.identity.path()
    }

    fn master_args(&self, control: &Path, log: &Path, destination: &str) -> Vec<OsString> {
        let settings = &self.shared.settings;
        let mut args = vec![
            OsString::from("-M"),
            OsString::from("-S"),
            control.as_os_str().to_owned(),
            OsString::from("-f"),
            OsString::from("-N"),
            OsString::from("-E"),
            log.as_os_str().to_owned(),
            OsString::from("-p"),
            OsString::from(settings.port.to_string()),
            OsString::from("-i"),
            self.identity_path().as_os_str().to_owned(),
        ];
        for option in [
            String::from("ControlPersist=yes"),
            String::from("IdentitiesOnly=yes"),
            String::from("BatchMode=yes"),
            String::from("PasswordAuthentication=no"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            format!("ConnectTimeout={}", settings.connect_timeout_secs),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(destination));
        args
    }
}

impl<R: CommandRunner + Clone + Send + 'static> Connector for OpenSshConnector<R> {
    type Connection = OpenSshConnection<R>;

    fn connect(
        &self,
        node: &FleetNode,
        address: IpAddr,
    ) -> Result<Self::Connection, TransportError> {
        let settings = &self.shared.settings;
        let socket_name = socket_name(&node.name);
        let control_dir = self.shared.control_dir.path();
        let control_path = control_dir.join(format!("{socket_name}.sock"));
        let log_name = format!("{socket_name}.log");
        let log_path = control_dir.join(&log_name);
        let destination = format!("{}@{address}", settings.user);

        let args = self.master_args(&control_path, &log_path, &destination);
        debug!(node = %node.name, %destination, "starting ssh master");
        let code = self
            .runner
            .run_detached(&settings.ssh_bin, &args)
            .map_err(|err| TransportError::new(err.to_string()))?;
        if code != Some(0) {
            let detail = read_master_log(control_dir, &log_name);
            return Err(TransportError::new(format!(
                "ssh exited with status {}{}",
                status_text(code),
                render_detail(&detail)
            )));
        }

        Ok(OpenSshConnection {
            runner: self.runner.clone(),
            shared: Arc::clone(&self.shared),
            control_path,
            destination,
            closed: false,
        })
    }
}

/// One multiplexed OpenSSH connection.
pub struct OpenSshConnection<R> {
    runner: R,
    shared: Arc<ConnectorShared>,
    control_path: PathBuf,
    destination: String,
    closed: bool,
}

impl<R> std::fmt::Debug for OpenSshConnection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSshConnection")
            .field("destination", &self.destination)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner> OpenSshConnection<R> {
    fn settings(&self) -> &SshSettings {
        &self.shared.settings
    }

    fn control_option(&self) -> OsString {
        let mut option = OsString::from("ControlPath=");
        option.push(self.control_path.as_os_str());
        option
    }

    fn command_args(&self, command: &str) -> Vec<OsString> {
        vec![
            OsString::from("-S"),
            self.control_path.as_os_str().to_owned(),
            OsString::from("-p"),
            OsString::from(self.settings().port.to_string()),
            OsString::from("-o"),
            OsString::from("ControlMaster=no"),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from(&self.destination),
            OsString::from(command),
        ]
    }

    fn copy_args(&self, payload: &Utf8Path) -> Vec<OsString> {
        vec![
            OsString::from("-r"),
            OsString::from("-o"),
            self.control_option(),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-P"),
            OsString::from(self.settings().port.to_string()),
            OsString::from(payload.as_str()),
            OsString::from(format!(
                "{}:{}",
                self.destination,
                self.settings().remote_payload_root
            )),
        ]
    }

    fn exit_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-S"),
            self.control_path.as_os_str().to_owned(),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(&self.destination),
        ]
    }
}

impl<R: CommandRunner + Send + 'static> Connection for OpenSshConnection<R> {
    fn deliver(&mut self, payload: &Utf8Path) -> Result<(), TransportError> {
        let scp_bin = self.settings().scp_bin.clone();
        let output = self
            .runner
            .run(&scp_bin, &self.copy_args(payload))
            .map_err(|err| TransportError::new(err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::new(format!(
            "scp exited with status {}{}",
            output.status_text(),
            render_detail(&output.stderr)
        )))
    }

    fn execute(&mut self, command: &str, sink: &mut OutputSink) -> Result<(), TransportError> {
        let ssh_bin = self.settings().ssh_bin.clone();
        let code = self
            .runner
            .run_streaming(&ssh_bin, &self.command_args(command), sink)
            .map_err(|err| TransportError::new(err.to_string()))?;
        if code == Some(0) {
            return Ok(());
        }
        Err(TransportError::new(format!(
            "exited with status {}",
            status_text(code)
        )))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let ssh_bin = self.settings().ssh_bin.clone();
        let output = self
            .runner
            .run(&ssh_bin, &self.exit_args())
            .map_err(|err| TransportError::new(err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::new(format!(
            "ssh -O exit returned status {}{}",
            output.status_text(),
            render_detail(&output.stderr)
        )))
    }
}

/// Maps a node name onto a safe socket file name.
fn socket_name(node: &str) -> String {
    node.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Best-effort read of the master's `-E` log.
fn read_master_log(control_dir: &Path, log_name: &str) -> String {
    Dir::open_ambient_dir(control_dir, ambient_authority())
        .and_then(|dir| dir.read_to_string(log_name))
        .unwrap_or_default()
}

fn render_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

//! Address artifacts written into payload directories.
//!
//! Every unique payload directory receives `public_ipv4s.json` and
//! `public_ipv4s.sh` describing the public address of each bound node, so the
//! bootstrap scripts shipped in the payload can find their peers.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::directory::DirectoryError;
use crate::fleet::Fleet;

/// File name of the JSON address map.
pub const JSON_ARTIFACT: &str = "public_ipv4s.json";
/// File name of the shell-sourceable address map.
pub const SHELL_ARTIFACT: &str = "public_ipv4s.sh";

/// Errors raised while producing address artifacts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Raised when a bound node has no usable address.
    #[error("node {node} cannot be addressed: {source}")]
    Address {
        /// Node whose instance lacks an address.
        node: String,
        /// Underlying directory error.
        source: DirectoryError,
    },
    /// Raised when a payload directory or artifact cannot be written.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Path being written.
        path: Utf8PathBuf,
        /// Operating system or serialiser error string.
        message: String,
    },
    /// Raised when two node names sanitise to the same shell variable.
    #[error("nodes {first} and {second} both map to shell variable {variable}")]
    VariableCollision {
        /// Shared variable name.
        variable: String,
        /// Node that claimed the variable first.
        first: String,
        /// Node whose export would overwrite it.
        second: String,
    },
}

/// Maps each bound node name to its public IPv4 address.
///
/// # Errors
///
/// Returns [`ArtifactError::Address`] when a bound instance has no public
/// address.
pub fn public_addresses(fleet: &Fleet) -> Result<BTreeMap<String, String>, ArtifactError> {
    fleet
        .bound_nodes()
        .filter_map(|node| node.bound_instance().map(|instance| (node, instance)))
        .map(|(node, instance)| {
            instance
                .public_address()
                .map(|address| (node.name.clone(), address.to_string()))
                .map_err(|source| ArtifactError::Address {
                    node: node.name.clone(),
                    source,
                })
        })
        .collect()
}

/// Renders the address map as a bash script of `export` lines.
///
/// # Errors
///
/// Returns [`ArtifactError::VariableCollision`] when two node names map to
/// the same variable.
pub fn render_shell(addresses: &BTreeMap<String, String>) -> Result<String, ArtifactError> {
    let mut claimed: BTreeMap<String, &str> = BTreeMap::new();
    let mut script = String::from("#!/usr/bin/env bash\n");
    for (name, address) in addresses {
        let variable = shell_variable(name);
        if let Some(first) = claimed.insert(variable.clone(), name) {
            return Err(ArtifactError::VariableCollision {
                variable,
                first: first.to_owned(),
                second: name.clone(),
            });
        }
        script.push_str("export ");
        script.push_str(&variable);
        script.push('=');
        script.push_str(&escape(address.as_str().into()));
        script.push('\n');
    }
    Ok(script)
}

/// Turns a node name into a valid shell variable name.
#[must_use]
pub fn shell_variable(name: &str) -> String {
    let mut variable: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if variable.is_empty() || variable.starts_with(|ch: char| ch.is_ascii_digit()) {
        variable.insert(0, '_');
    }
    variable
}

/// Writes both artifacts into every unique payload directory of the fleet,
/// creating directories as needed, and returns the paths written.
///
/// # Errors
///
/// Returns [`ArtifactError::Address`] when an address cannot be resolved,
/// [`ArtifactError::VariableCollision`] when two node names share a shell
/// variable, and [`ArtifactError::Write`] when a directory or file cannot be
/// written. Nothing is written unless both artifacts render.
pub fn write_address_artifacts(fleet: &Fleet) -> Result<Vec<Utf8PathBuf>, ArtifactError> {
    let addresses = public_addresses(fleet)?;
    let json = serde_json::to_string_pretty(&addresses).map_err(|err| ArtifactError::Write {
        path: Utf8PathBuf::from(JSON_ARTIFACT),
        message: err.to_string(),
    })?;
    let shell = render_shell(&addresses)?;

    let payload_dirs: BTreeSet<&Utf8Path> =
        fleet.nodes().map(|node| node.payload_path()).collect();

    let mut written = Vec::with_capacity(payload_dirs.len() * 2);
    for payload_dir in payload_dirs {
        let dir = open_or_create(payload_dir)?;
        for (file_name, contents) in [(JSON_ARTIFACT, &json), (SHELL_ARTIFACT, &shell)] {
            let path = payload_dir.join(file_name);
            dir.write(file_name, contents)
                .map_err(|err| ArtifactError::Write {
                    path: path.clone(),
                    message: err.to_string(),
                })?;
            written.push(path);
        }
        info!(payload = %payload_dir, nodes = addresses.len(), "wrote address artifacts");
    }
    Ok(written)
}

fn open_or_create(path: &Utf8Path) -> Result<Dir, ArtifactError> {
    let write_error = |err: std::io::Error| ArtifactError::Write {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(write_error)?;
    Dir::open_ambient_dir(path, ambient_authority()).map_err(write_error)
}

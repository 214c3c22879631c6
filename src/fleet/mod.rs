//! Declared fleet model and its JSON description.
//!
//! A fleet document maps node names to node attributes and carries the tag
//! that scopes instance discovery plus the provider SSH key fingerprint. The
//! document is validated before anything touches the network: it must declare
//! at least one node, name an SSH key, and every peer reference must resolve
//! to another declared node.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

mod node;

pub use node::{FleetNode, NodeRole};

/// Tag applied to the starter fleet written by `devnet new-config`.
pub const DEFAULT_TAG: &str = "devnet";

/// Errors raised while loading, validating, or writing a fleet document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FleetConfigError {
    /// Raised when the document cannot be read.
    #[error("failed to read fleet description {path}: {message}")]
    Read {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the document is not valid fleet JSON.
    #[error("failed to parse fleet description: {message}")]
    Parse {
        /// Parser error message.
        message: String,
    },
    /// Raised when the document cannot be written.
    #[error("failed to write fleet description {path}: {message}")]
    Write {
        /// Destination path.
        path: Utf8PathBuf,
        /// Operating system or serialiser error string.
        message: String,
    },
    /// Raised when the fleet declares no nodes.
    #[error("no droplets configured")]
    NoNodes,
    /// Raised when the SSH key fingerprint is blank.
    #[error("no ssh key fingerprint provided")]
    MissingSshKey,
    /// Raised when a node names a peer that is not part of the fleet.
    #[error("{node} has a peer, {peer}, who is not defined in the fleet")]
    UnknownPeer {
        /// Node declaring the peer.
        node: String,
        /// Peer name that did not resolve.
        peer: String,
    },
}

/// The declared set of nodes for one deployment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Fleet {
    #[serde(rename = "droplets", default, deserialize_with = "null_as_default")]
    nodes: BTreeMap<String, FleetNode>,
    #[serde(rename = "ssh_key_id", default, deserialize_with = "null_as_default")]
    ssh_key_fingerprint: String,
    #[serde(default, deserialize_with = "null_as_default")]
    tag: String,
}

impl Fleet {
    /// Builds a fleet from nodes, keyed by each node's name.
    ///
    /// The result is not validated; call [`Fleet::validate`] before use.
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        ssh_key_fingerprint: impl Into<String>,
        nodes: impl IntoIterator<Item = FleetNode>,
    ) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.name.clone(), node))
                .collect(),
            ssh_key_fingerprint: ssh_key_fingerprint.into(),
            tag: tag.into(),
        }
    }

    /// Starter fleet with a single validator.
    #[must_use]
    pub fn example() -> Self {
        let validator = FleetNode::new(
            "validator1",
            NodeRole::Validator,
            "payload/validator",
            "logs/validator1.log",
        )
        .with_placement("nyc3", "s-1vcpu-1gb")
        .with_commands(["bash /root/validator/setup.sh"]);
        Self::new(DEFAULT_TAG, "put-do-ssh-key-finger-print-here", [validator])
    }

    /// Reads, parses, and validates the fleet document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetConfigError::Read`] when the file is unreadable, and
    /// the errors of [`Fleet::from_json`] otherwise.
    pub fn load(path: &Utf8Path) -> Result<Self, FleetConfigError> {
        let contents = read_document(path)?;
        Self::from_json(&contents)
    }

    /// Parses and validates a fleet document.
    ///
    /// # Errors
    ///
    /// Returns [`FleetConfigError::Parse`] for malformed JSON and the
    /// validation errors of [`Fleet::validate`].
    pub fn from_json(contents: &str) -> Result<Self, FleetConfigError> {
        let mut fleet: Self =
            serde_json::from_str(contents).map_err(|err| FleetConfigError::Parse {
                message: err.to_string(),
            })?;
        for (name, node) in &mut fleet.nodes {
            node.name.clone_from(name);
        }
        fleet.validate()?;
        Ok(fleet)
    }

    /// Checks the node set, key fingerprint, and peer graph.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, scanning nodes in name order.
    pub fn validate(&self) -> Result<(), FleetConfigError> {
        if self.nodes.is_empty() {
            return Err(FleetConfigError::NoNodes);
        }
        if self.ssh_key_fingerprint.trim().is_empty() {
            return Err(FleetConfigError::MissingSshKey);
        }
        for (name, node) in &self.nodes {
            if let Some(peer) = node
                .peers
                .iter()
                .find(|peer| !self.nodes.contains_key(peer.as_str()))
            {
                return Err(FleetConfigError::UnknownPeer {
                    node: name.clone(),
                    peer: peer.clone(),
                });
            }
        }
        Ok(())
    }

    /// Serialises the fleet as pretty-printed JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetConfigError::Write`] when serialisation or the write
    /// fails.
    pub fn write(&self, path: &Utf8Path) -> Result<(), FleetConfigError> {
        let write_error = |message: String| FleetConfigError::Write {
            path: path.to_path_buf(),
            message,
        };
        let rendered =
            serde_json::to_string_pretty(self).map_err(|err| write_error(err.to_string()))?;
        let (dir, file_name) = open_parent(path).map_err(write_error)?;
        dir.write(file_name, format!("{rendered}\n"))
            .map_err(|err| write_error(err.to_string()))
    }

    /// Tag used to scope instance discovery.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Provider SSH key fingerprint; passed through untouched.
    #[must_use]
    pub fn ssh_key_fingerprint(&self) -> &str {
        &self.ssh_key_fingerprint
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&FleetNode> {
        self.nodes.get(name)
    }

    /// All nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &FleetNode> {
        self.nodes.values()
    }

    /// Nodes matched to a live instance, in name order.
    pub fn bound_nodes(&self) -> impl Iterator<Item = &FleetNode> {
        self.nodes.values().filter(|node| node.is_bound())
    }

    /// Number of declared nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when no nodes are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> Option<&mut FleetNode> {
        self.nodes.get_mut(name)
    }

    pub(crate) fn clear_bindings(&mut self) {
        for node in self.nodes.values_mut() {
            node.unbind();
        }
    }
}

/// Reads an optional field, treating an explicit `null` like a missing key.
///
/// Older tooling serialised empty lists as `null` and wrote zero values for
/// unset fields; both load as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), String> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| String::from("path is missing a file name"))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    Ok((dir, file_name))
}

fn read_document(path: &Utf8Path) -> Result<String, FleetConfigError> {
    let read_error = |message: String| FleetConfigError::Read {
        path: path.to_path_buf(),
        message,
    };
    let (dir, file_name) = open_parent(path).map_err(read_error)?;
    dir.read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))
}

//! Declared fleet members and their roles.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::directory::Instance;

/// Part a node plays in the test network.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "RawRole")]
pub enum NodeRole {
    /// Consensus participant. Documents that omit the role get this one.
    #[default]
    Validator,
    /// Non-validating full node.
    Full,
    /// Light client.
    LightClient,
    /// Distributed hash table peer.
    #[serde(rename = "DHT")]
    Dht,
}

impl NodeRole {
    /// Roles in declaration order; the index doubles as the legacy numeric
    /// encoding.
    pub const ALL: [Self; 4] = [Self::Validator, Self::Full, Self::LightClient, Self::Dht];

    /// Canonical name used in fleet documents and provider tags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validator => "Validator",
            Self::Full => "Full",
            Self::LightClient => "LightClient",
            Self::Dht => "DHT",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown node role '{value}'"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRole {
    Name(String),
    Index(u64),
}

impl TryFrom<RawRole> for NodeRole {
    type Error = String;

    fn try_from(value: RawRole) -> Result<Self, Self::Error> {
        match value {
            RawRole::Name(name) => name.parse(),
            RawRole::Index(index) => usize::try_from(index)
                .ok()
                .and_then(|position| Self::ALL.get(position).copied())
                .ok_or_else(|| format!("unknown node role index {index}")),
        }
    }
}

/// One logical member of the fleet.
///
/// Everything except the bound instance comes from the fleet document. The
/// bound instance is attached by reconciliation and is never serialised.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FleetNode {
    /// Unique node name; mirrors the key in the fleet document.
    #[serde(skip)]
    pub name: String,
    /// Provider region, for example `nyc3`.
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub location: String,
    /// Provider size slug, for example `s-1vcpu-1gb`.
    #[serde(rename = "size", default, deserialize_with = "super::null_as_default")]
    pub size_class: String,
    /// Role of the node in the network.
    #[serde(
        rename = "droplet_type",
        default,
        deserialize_with = "super::null_as_default"
    )]
    pub role: NodeRole,
    /// Local directory copied to the remote host before bootstrap.
    #[serde(rename = "payload")]
    pub payload_path: Utf8PathBuf,
    /// Commands run on the host after delivery, in order.
    #[serde(
        rename = "init_commands",
        default,
        deserialize_with = "super::null_as_default"
    )]
    pub bootstrap_commands: Vec<String>,
    /// Names of other fleet nodes this node connects to.
    #[serde(default, alias = "Peers", deserialize_with = "super::null_as_default")]
    pub peers: Vec<String>,
    /// Local file receiving the combined output of the bootstrap commands.
    #[serde(rename = "output")]
    pub output_path: Utf8PathBuf,
    #[serde(skip)]
    bound_instance: Option<Instance>,
}

impl FleetNode {
    /// Creates a node with empty location, size, commands, and peers.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        role: NodeRole,
        payload_path: impl Into<Utf8PathBuf>,
        output_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            location: String::new(),
            size_class: String::new(),
            role,
            payload_path: payload_path.into(),
            bootstrap_commands: Vec::new(),
            peers: Vec::new(),
            output_path: output_path.into(),
            bound_instance: None,
        }
    }

    /// Sets the provider region and size slug.
    #[must_use]
    pub fn with_placement(mut self, location: impl Into<String>, size: impl Into<String>) -> Self {
        self.location = location.into();
        self.size_class = size.into();
        self
    }

    /// Replaces the bootstrap command list.
    #[must_use]
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the peer list.
    #[must_use]
    pub fn with_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Live instance matched to this node, if reconciliation found one.
    #[must_use]
    pub const fn bound_instance(&self) -> Option<&Instance> {
        self.bound_instance.as_ref()
    }

    /// Returns `true` once reconciliation has matched an instance.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound_instance.is_some()
    }

    /// Local payload directory.
    #[must_use]
    pub fn payload_path(&self) -> &Utf8Path {
        &self.payload_path
    }

    pub(crate) fn bind(&mut self, instance: Instance) {
        self.bound_instance = Some(instance);
    }

    pub(crate) fn unbind(&mut self) {
        self.bound_instance = None;
    }
}

//! Configuration loading via `ortho-config`.

use std::fmt;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::credential::Passphrase;
use crate::directory::{DEFAULT_API_BASE_URL, DigitalOceanDirectory, DirectoryError};
use crate::exec::expand_tilde;
use crate::session::{DEFAULT_REMOTE_PAYLOAD_ROOT, SshSettings};

/// Runtime settings merged from defaults, configuration files, and
/// `DEVNET_*` environment variables.
#[derive(Clone, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DEVNET",
    discovery(
        app_name = "devnet",
        env_var = "DEVNET_CONFIG_PATH",
        config_file_name = "devnet.toml",
        dotfile_name = ".devnet.toml",
        project_file_name = "devnet.toml"
    )
)]
pub struct DevnetConfig {
    /// Bearer token for the DigitalOcean API. Required.
    pub digitalocean_token: String,
    /// API root, overridable for staging endpoints and tests.
    #[ortho_config(default = DEFAULT_API_BASE_URL.to_owned())]
    pub api_base_url: String,
    /// Remote login user.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for every node. Supports tilde expansion.
    #[ortho_config(default = "~/.ssh/id_rsa".to_owned())]
    pub ssh_key_path: String,
    /// Key passphrase. `nil` skips decryption; unset prompts on stdin.
    pub ssh_pass: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote directory receiving payloads.
    #[ortho_config(default = DEFAULT_REMOTE_PAYLOAD_ROOT.to_owned())]
    pub remote_payload_root: String,
    /// Seconds allowed for each SSH connection handshake.
    #[ortho_config(default = 15)]
    pub ssh_connect_timeout_secs: u32,
}

impl fmt::Debug for DevnetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevnetConfig")
            .field("digitalocean_token", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_key_path", &self.ssh_key_path)
            .field("ssh_pass", &self.ssh_pass.as_ref().map(|_| "<redacted>"))
            .field("ssh_bin", &self.ssh_bin)
            .field("scp_bin", &self.scp_bin)
            .field("remote_payload_root", &self.remote_payload_root)
            .field("ssh_connect_timeout_secs", &self.ssh_connect_timeout_secs)
            .finish()
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl DevnetConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("devnet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to devnet.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::InvalidValue`] when the SSH port or timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.digitalocean_token,
                FieldMetadata::new(
                    "DigitalOcean API token",
                    "DEVNET_DIGITALOCEAN_TOKEN",
                    "digitalocean_token",
                ),
            ),
            (
                &self.api_base_url,
                FieldMetadata::new("API base URL", "DEVNET_API_BASE_URL", "api_base_url"),
            ),
            (
                &self.ssh_user,
                FieldMetadata::new("SSH user", "DEVNET_SSH_USER", "ssh_user"),
            ),
            (
                &self.ssh_key_path,
                FieldMetadata::new("SSH key path", "DEVNET_SSH_KEY_PATH", "ssh_key_path"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh executable", "DEVNET_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.scp_bin,
                FieldMetadata::new("scp executable", "DEVNET_SCP_BIN", "scp_bin"),
            ),
            (
                &self.remote_payload_root,
                FieldMetadata::new(
                    "remote payload root",
                    "DEVNET_REMOTE_PAYLOAD_ROOT",
                    "remote_payload_root",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "ssh_port must be between 1 and 65535 (DEVNET_SSH_PORT)",
            )));
        }
        if self.ssh_connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "ssh_connect_timeout_secs must be positive (DEVNET_SSH_CONNECT_TIMEOUT_SECS)",
            )));
        }
        Ok(())
    }

    /// Private key path with `~/` expanded.
    #[must_use]
    pub fn key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.ssh_key_path))
    }

    /// Configured passphrase, or `None` when the operator must be prompted.
    #[must_use]
    pub fn passphrase(&self) -> Option<Passphrase> {
        self.ssh_pass.as_deref().map(Passphrase::from_input)
    }

    /// Settings injected into the SSH transport.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            remote_payload_root: self.remote_payload_root.clone(),
            connect_timeout_secs: self.ssh_connect_timeout_secs,
        }
    }

    /// Directory client for the configured account.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Client`] when the API root is invalid or the
    /// HTTP client cannot be built.
    pub fn directory(&self) -> Result<DigitalOceanDirectory, DirectoryError> {
        DigitalOceanDirectory::new(self.digitalocean_token.clone(), self.api_base_url.clone())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

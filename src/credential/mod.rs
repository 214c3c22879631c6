//! Private key loading for SSH authentication.
//!
//! A credential is read from a single PEM block. Legacy encrypted blocks
//! (`Proc-Type: 4,ENCRYPTED` plus `DEK-Info`) are decrypted with the supplied
//! passphrase, and the body is parsed according to the block's declared type.
//! Supported types are `RSA PRIVATE KEY`, `EC PRIVATE KEY` on P-256, P-384 or
//! P-521, `DSA PRIVATE KEY`, and unencrypted PKCS#8 `PRIVATE KEY` holding RSA
//! or one of those curves.
//!
//! `OPENSSH PRIVATE KEY` containers, the default output of `ssh-keygen`, are
//! handed to `ssh-key`. They may hold RSA, ECDSA, DSA or Ed25519 keys and may
//! be bcrypt-encrypted.
//!
//! Key material and passphrases are zeroised on drop and never appear in
//! `Debug` output or logs.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use pem::{EncodeConfig, LineEnding, Pem};
use thiserror::Error;
use zeroize::Zeroizing;

mod keys;
mod legacy;

pub use keys::CredentialSignature;
use keys::{KeyMaterial, ParseFailure};
use legacy::DekInfo;

/// Passphrase value that skips decryption entirely.
pub const SKIP_SENTINEL: &str = "nil";

/// Passphrase supplied by the operator.
#[derive(Clone)]
pub enum Passphrase {
    /// Bypass decryption and parse the block as plain key material.
    Skip,
    /// Passphrase used to decrypt an encrypted block.
    Provided(Zeroizing<String>),
}

impl Passphrase {
    /// Interprets raw operator input, mapping [`SKIP_SENTINEL`] to
    /// [`Passphrase::Skip`].
    #[must_use]
    pub fn from_input(input: &str) -> Self {
        if input == SKIP_SENTINEL {
            Self::Skip
        } else {
            Self::Provided(Zeroizing::new(input.to_owned()))
        }
    }

    /// Wraps a passphrase without sentinel interpretation.
    #[must_use]
    pub fn provided(value: impl Into<String>) -> Self {
        Self::Provided(Zeroizing::new(value.into()))
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("Passphrase::Skip"),
            Self::Provided(_) => f.write_str("Passphrase::Provided(<redacted>)"),
        }
    }
}

/// Encoding family of a parsed key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyFamily {
    /// RSA.
    Rsa,
    /// ECDSA over a NIST curve.
    Ec,
    /// DSA.
    Dsa,
    /// Ed25519, from OpenSSH keys only.
    Ed25519,
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
            Self::Dsa => "DSA",
            Self::Ed25519 => "ED25519",
        })
    }
}

/// Errors raised while loading a credential.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when the key file cannot be read.
    #[error("failed to read private key {path}: {message}")]
    Read {
        /// Key file path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when no PEM block is found or the key body is malformed.
    #[error("private key is not a valid PEM key: {message}")]
    KeyFormat {
        /// Decoder error message.
        message: String,
    },
    /// Raised when an encrypted key cannot be decrypted.
    #[error("failed to decrypt private key: {message}")]
    Decryption {
        /// Reason decryption failed.
        message: String,
    },
    /// Raised when the key type, curve, or OpenSSH algorithm has no signer.
    #[error("unsupported private key type '{key_type}'")]
    UnsupportedKeyType {
        /// PEM block type.
        key_type: String,
    },
    /// Raised when signing with the key fails.
    #[error("signing failed: {message}")]
    Signing {
        /// Signature library error.
        message: String,
    },
}

/// A parsed private signing key.
pub struct Credential {
    material: KeyMaterial,
    identity: Zeroizing<String>,
    encrypted: bool,
}

impl Credential {
    /// Reads and loads the key stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Read`] when the file cannot be read and the
    /// errors of [`Credential::load`] otherwise.
    pub fn from_file(path: &Utf8Path, passphrase: &Passphrase) -> Result<Self, CredentialError> {
        let read_error = |message: String| CredentialError::Read {
            path: path.to_path_buf(),
            message,
        };
        let parent = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| read_error(String::from("path is missing a file name")))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| read_error(err.to_string()))?;
        let bytes = Zeroizing::new(
            dir.read(file_name)
                .map_err(|err| read_error(err.to_string()))?,
        );
        Self::load(&bytes, passphrase)
    }

    /// Parses a PEM-encoded or OpenSSH private key.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::KeyFormat`] when no PEM block is present or the
    ///   unencrypted body is malformed.
    /// - [`CredentialError::Decryption`] when the key is encrypted and the
    ///   passphrase is empty, skipped, or wrong.
    /// - [`CredentialError::UnsupportedKeyType`] for unknown block types,
    ///   curves, or OpenSSH algorithms.
    pub fn load(key_bytes: &[u8], passphrase: &Passphrase) -> Result<Self, CredentialError> {
        let block = pem::parse(key_bytes).map_err(|err| CredentialError::KeyFormat {
            message: err.to_string(),
        })?;
        let tag = block.tag().to_owned();
        if tag == keys::OPENSSH_TAG {
            return Self::load_openssh(key_bytes, passphrase);
        }
        let parse = keys::parser_for(&tag)
            .ok_or_else(|| CredentialError::UnsupportedKeyType {
                key_type: tag.clone(),
            })?;

        let encrypted = is_encrypted(&block);
        let der = if encrypted {
            decrypt_block(&block, passphrase)?
        } else {
            Zeroizing::new(block.contents().to_vec())
        };

        let material = parse(&der).map_err(|failure| match failure {
            ParseFailure::Unsupported(key_type) => CredentialError::UnsupportedKeyType { key_type },
            ParseFailure::Malformed(_) if encrypted => wrong_passphrase(),
            ParseFailure::Malformed(message) => CredentialError::KeyFormat { message },
        })?;

        let identity = Zeroizing::new(pem::encode_config(
            &Pem::new(tag, der.to_vec()),
            EncodeConfig::new().set_line_ending(LineEnding::LF),
        ));
        Ok(Self {
            material,
            identity,
            encrypted,
        })
    }

    fn load_openssh(key_bytes: &[u8], passphrase: &Passphrase) -> Result<Self, CredentialError> {
        let stored = ssh_key::PrivateKey::from_openssh(key_bytes).map_err(|err| {
            CredentialError::KeyFormat {
                message: err.to_string(),
            }
        })?;
        let encrypted = stored.is_encrypted();
        let key = if encrypted {
            let secret = required_secret(passphrase)?;
            stored
                .decrypt(secret.as_bytes())
                .map_err(|_| wrong_passphrase())?
        } else {
            stored
        };

        let identity = key
            .to_openssh(ssh_key::LineEnding::LF)
            .map_err(|err| CredentialError::KeyFormat {
                message: err.to_string(),
            })?;
        let material = KeyMaterial::from_openssh(key).map_err(|failure| match failure {
            ParseFailure::Unsupported(key_type) => CredentialError::UnsupportedKeyType { key_type },
            ParseFailure::Malformed(message) => CredentialError::KeyFormat { message },
        })?;
        Ok(Self {
            material,
            identity,
            encrypted,
        })
    }

    /// Encoding family of the key.
    #[must_use]
    pub const fn family(&self) -> KeyFamily {
        self.material.family()
    }

    /// Returns `true` when the key was stored encrypted.
    #[must_use]
    pub const fn was_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Signs `message` with the key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] when the signature library
    /// rejects the operation.
    pub fn sign(&self, message: &[u8]) -> Result<CredentialSignature, CredentialError> {
        self.material
            .sign(message)
            .map_err(|err| CredentialError::Signing {
                message: err.to_string(),
            })
    }

    /// Checks `signature` against the key's public half.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &CredentialSignature) -> bool {
        self.material.verify(message, signature)
    }

    /// Unencrypted rendering of the key in its source container, suitable
    /// for an SSH client identity file.
    #[must_use]
    pub fn identity_pem(&self) -> Zeroizing<String> {
        self.identity.clone()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("family", &self.family())
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

fn is_encrypted(block: &Pem) -> bool {
    let headers = block.headers();
    headers.get("DEK-Info").is_some()
        || headers
            .get("Proc-Type")
            .is_some_and(|value| value.contains("ENCRYPTED"))
}

/// Passphrase text for an encrypted key; skipped or empty input cannot
/// decrypt anything.
fn required_secret(passphrase: &Passphrase) -> Result<&str, CredentialError> {
    match passphrase {
        Passphrase::Skip => Err(CredentialError::Decryption {
            message: String::from("key is encrypted but passphrase entry was skipped"),
        }),
        Passphrase::Provided(secret) if secret.is_empty() => Err(CredentialError::Decryption {
            message: String::from("key is encrypted but the passphrase is empty"),
        }),
        Passphrase::Provided(secret) => Ok(secret.as_str()),
    }
}

fn wrong_passphrase() -> CredentialError {
    CredentialError::Decryption {
        message: String::from("incorrect passphrase or corrupt key data"),
    }
}

fn decrypt_block(
    block: &Pem,
    passphrase: &Passphrase,
) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
    let decryption_error = |message: String| CredentialError::Decryption { message };
    let secret = required_secret(passphrase)?;
    let dek_info = block
        .headers()
        .get("DEK-Info")
        .ok_or_else(|| decryption_error(String::from("encrypted key has no DEK-Info header")))?;
    let dek = DekInfo::parse(dek_info).map_err(decryption_error)?;
    legacy::decrypt(&dek, secret.as_bytes(), block.contents()).map_err(decryption_error)
}

#[cfg(test)]
mod tests;

//! Key-type dispatch for decoded PEM bodies and OpenSSH keys.

use der::Decode;
use der::asn1::UintRef;
use pkcs8::{AssociatedOid, DecodePrivateKey, ObjectIdentifier};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use sec1::{EcParameters, EcPrivateKey};
use sha2::{Digest, Sha256};
use signature::{DigestSigner, DigestVerifier, Keypair, Signer, Verifier};
use ssh_key::Algorithm;

use super::KeyFamily;

/// PEM tag of the OpenSSH private key container.
pub(super) const OPENSSH_TAG: &str = "OPENSSH PRIVATE KEY";

/// Curves recognised by name so rejections can say which one was found.
const UNSUPPORTED_CURVES: [(&str, &str); 3] = [
    ("1.3.132.0.33", "secp224r1"),
    ("1.3.132.0.10", "secp256k1"),
    ("1.3.36.3.3.2.8.1.1.7", "brainpoolP256r1"),
];

/// Parsed private key, closed over the supported families.
pub(super) enum KeyMaterial {
    Rsa(Box<rsa::pkcs1v15::SigningKey<Sha256>>),
    EcP256(p256::ecdsa::SigningKey),
    EcP384(p384::ecdsa::SigningKey),
    EcP521(Box<p521::ecdsa::SigningKey>),
    Dsa(Box<dsa::SigningKey>),
    OpenSsh {
        key: Box<ssh_key::PrivateKey>,
        family: KeyFamily,
    },
}

/// Signature produced by a [`super::Credential`].
#[derive(Clone, Debug)]
pub enum CredentialSignature {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    Rsa(rsa::pkcs1v15::Signature),
    /// ECDSA over P-256 with SHA-256.
    EcP256(p256::ecdsa::Signature),
    /// ECDSA over P-384 with SHA-384.
    EcP384(p384::ecdsa::Signature),
    /// ECDSA over P-521 with SHA-512.
    EcP521(p521::ecdsa::Signature),
    /// DSA with SHA-256.
    Dsa(dsa::Signature),
    /// SSH wire-format signature from an OpenSSH key.
    OpenSsh(ssh_key::Signature),
}

/// Why a decoded body could not become key material.
#[derive(Debug)]
pub(super) enum ParseFailure {
    /// The bytes do not decode as the declared type.
    Malformed(String),
    /// The bytes decode but name an algorithm or curve with no signer.
    Unsupported(String),
}

fn malformed(err: impl std::fmt::Display) -> ParseFailure {
    ParseFailure::Malformed(err.to_string())
}

type ParseFn = fn(&[u8]) -> Result<KeyMaterial, ParseFailure>;

/// PEM tag to parser lookup.
const PARSERS: [(&str, ParseFn); 4] = [
    ("RSA PRIVATE KEY", parse_rsa),
    ("EC PRIVATE KEY", parse_ec),
    ("DSA PRIVATE KEY", parse_dsa),
    ("PRIVATE KEY", parse_pkcs8),
];

/// Finds the parser registered for a PEM tag.
pub(super) fn parser_for(tag: &str) -> Option<ParseFn> {
    PARSERS
        .iter()
        .find(|(candidate, _)| *candidate == tag)
        .map(|(_, parse)| *parse)
}

fn parse_rsa(der: &[u8]) -> Result<KeyMaterial, ParseFailure> {
    let key = RsaPrivateKey::from_pkcs1_der(der).map_err(malformed)?;
    Ok(KeyMaterial::from_rsa(key))
}

/// Decodes a SEC1 body and picks the signer from its named curve.
fn parse_ec(der: &[u8]) -> Result<KeyMaterial, ParseFailure> {
    let curve = EcPrivateKey::from_der(der)
        .map_err(malformed)?
        .parameters
        .and_then(EcParameters::named_curve)
        .ok_or_else(|| ParseFailure::Malformed(String::from("EC key does not name its curve")))?;

    if curve == p256::NistP256::OID {
        let secret = p256::SecretKey::from_sec1_der(der).map_err(malformed)?;
        Ok(KeyMaterial::EcP256(p256::ecdsa::SigningKey::from(secret)))
    } else if curve == p384::NistP384::OID {
        let secret = p384::SecretKey::from_sec1_der(der).map_err(malformed)?;
        Ok(KeyMaterial::EcP384(p384::ecdsa::SigningKey::from(secret)))
    } else if curve == p521::NistP521::OID {
        let secret = p521::SecretKey::from_sec1_der(der).map_err(malformed)?;
        p521_material(&secret)
    } else {
        Err(ParseFailure::Unsupported(format!(
            "EC PRIVATE KEY on curve {}",
            curve_name(curve)
        )))
    }
}

fn p521_material(secret: &p521::SecretKey) -> Result<KeyMaterial, ParseFailure> {
    let key = p521::ecdsa::SigningKey::from_bytes(&secret.to_bytes()).map_err(malformed)?;
    Ok(KeyMaterial::EcP521(Box::new(key)))
}

fn curve_name(curve: ObjectIdentifier) -> String {
    let dotted = curve.to_string();
    UNSUPPORTED_CURVES
        .iter()
        .find(|(oid, _)| *oid == dotted)
        .map_or_else(|| dotted.clone(), |(_, name)| format!("{name} ({dotted})"))
}

/// OpenSSL `DSA PRIVATE KEY` body.
#[derive(der::Sequence)]
struct DsaPrivateKeyDer<'a> {
    version: UintRef<'a>,
    p: UintRef<'a>,
    q: UintRef<'a>,
    g: UintRef<'a>,
    y: UintRef<'a>,
    x: UintRef<'a>,
}

fn parse_dsa(der: &[u8]) -> Result<KeyMaterial, ParseFailure> {
    let raw = DsaPrivateKeyDer::from_der(der).map_err(malformed)?;
    if !raw.version.as_bytes().iter().all(|byte| *byte == 0) {
        return Err(ParseFailure::Malformed(String::from(
            "unsupported DSA key version",
        )));
    }
    let uint = |value: UintRef<'_>| dsa::BigUint::from_bytes_be(value.as_bytes());
    let components = dsa::Components::from_components(uint(raw.p), uint(raw.q), uint(raw.g))
        .map_err(malformed)?;
    let verifying =
        dsa::VerifyingKey::from_components(components, uint(raw.y)).map_err(malformed)?;
    let signing = dsa::SigningKey::from_components(verifying, uint(raw.x)).map_err(malformed)?;
    Ok(KeyMaterial::Dsa(Box::new(signing)))
}

fn parse_pkcs8(der: &[u8]) -> Result<KeyMaterial, ParseFailure> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return Ok(KeyMaterial::from_rsa(key));
    }
    if let Ok(secret) = p256::SecretKey::from_pkcs8_der(der) {
        return Ok(KeyMaterial::EcP256(p256::ecdsa::SigningKey::from(secret)));
    }
    if let Ok(secret) = p384::SecretKey::from_pkcs8_der(der) {
        return Ok(KeyMaterial::EcP384(p384::ecdsa::SigningKey::from(secret)));
    }
    let secret = p521::SecretKey::from_pkcs8_der(der).map_err(|err| {
        ParseFailure::Malformed(format!(
            "PKCS#8 key is not RSA, P-256, P-384 or P-521: {err}"
        ))
    })?;
    p521_material(&secret)
}

impl KeyMaterial {
    fn from_rsa(key: RsaPrivateKey) -> Self {
        Self::Rsa(Box::new(rsa::pkcs1v15::SigningKey::<Sha256>::new(key)))
    }

    /// Wraps a decrypted OpenSSH key whose algorithm has a signer.
    pub(super) fn from_openssh(key: ssh_key::PrivateKey) -> Result<Self, ParseFailure> {
        let family = match key.algorithm() {
            Algorithm::Rsa { .. } => KeyFamily::Rsa,
            Algorithm::Ecdsa { .. } => KeyFamily::Ec,
            Algorithm::Dsa => KeyFamily::Dsa,
            Algorithm::Ed25519 => KeyFamily::Ed25519,
            other => {
                return Err(ParseFailure::Unsupported(format!(
                    "{OPENSSH_TAG} ({other})"
                )));
            }
        };
        Ok(Self::OpenSsh {
            key: Box::new(key),
            family,
        })
    }

    pub(super) const fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa(_) => KeyFamily::Rsa,
            Self::EcP256(_) | Self::EcP384(_) | Self::EcP521(_) => KeyFamily::Ec,
            Self::Dsa(_) => KeyFamily::Dsa,
            Self::OpenSsh { family, .. } => *family,
        }
    }

    pub(super) fn sign(&self, message: &[u8]) -> Result<CredentialSignature, signature::Error> {
        Ok(match self {
            Self::Rsa(key) => {
                let signature: rsa::pkcs1v15::Signature = key.try_sign(message)?;
                CredentialSignature::Rsa(signature)
            }
            Self::EcP256(key) => {
                let signature: p256::ecdsa::Signature = key.try_sign(message)?;
                CredentialSignature::EcP256(signature)
            }
            Self::EcP384(key) => {
                let signature: p384::ecdsa::Signature = key.try_sign(message)?;
                CredentialSignature::EcP384(signature)
            }
            Self::EcP521(key) => {
                let signature: p521::ecdsa::Signature = key.try_sign(message)?;
                CredentialSignature::EcP521(signature)
            }
            Self::Dsa(key) => {
                let signature: dsa::Signature =
                    key.try_sign_digest(Sha256::new_with_prefix(message))?;
                CredentialSignature::Dsa(signature)
            }
            Self::OpenSsh { key, .. } => CredentialSignature::OpenSsh(
                Signer::<ssh_key::Signature>::try_sign(key.as_ref(), message)?,
            ),
        })
    }

    pub(super) fn verify(&self, message: &[u8], signature: &CredentialSignature) -> bool {
        match (self, signature) {
            (Self::Rsa(key), CredentialSignature::Rsa(sig)) => {
                key.verifying_key().verify(message, sig).is_ok()
            }
            (Self::EcP256(key), CredentialSignature::EcP256(sig)) => {
                key.verifying_key().verify(message, sig).is_ok()
            }
            (Self::EcP384(key), CredentialSignature::EcP384(sig)) => {
                key.verifying_key().verify(message, sig).is_ok()
            }
            (Self::EcP521(key), CredentialSignature::EcP521(sig)) => {
                p521::ecdsa::VerifyingKey::from(key.as_ref())
                    .verify(message, sig)
                    .is_ok()
            }
            (Self::Dsa(key), CredentialSignature::Dsa(sig)) => key
                .verifying_key()
                .verify_digest(Sha256::new_with_prefix(message), sig)
                .is_ok(),
            (Self::OpenSsh { key, .. }, CredentialSignature::OpenSsh(sig)) => {
                Verifier::verify(key.public_key(), message, sig).is_ok()
            }
            _ => false,
        }
    }
}

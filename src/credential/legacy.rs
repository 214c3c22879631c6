//! RFC 1421 style PEM encryption (`Proc-Type: 4,ENCRYPTED` with `DEK-Info`).
//!
//! Keys are derived from the passphrase with OpenSSL's `EVP_BytesToKey`
//! (MD5, one iteration, salt taken from the first eight IV bytes).

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use md5::{Digest, Md5};
use zeroize::Zeroizing;

const SALT_LEN: usize = 8;

/// Block ciphers accepted in `DEK-Info` headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum LegacyCipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    DesEde3Cbc,
    DesCbc,
}

impl LegacyCipher {
    const TABLE: [(&'static str, Self); 5] = [
        ("AES-128-CBC", Self::Aes128Cbc),
        ("AES-192-CBC", Self::Aes192Cbc),
        ("AES-256-CBC", Self::Aes256Cbc),
        ("DES-EDE3-CBC", Self::DesEde3Cbc),
        ("DES-CBC", Self::DesCbc),
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, cipher)| *cipher)
    }

    pub(super) fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, cipher)| *cipher == self)
            .map_or("unknown", |(name, _)| name)
    }

    const fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc | Self::DesEde3Cbc => 24,
            Self::Aes256Cbc => 32,
            Self::DesCbc => 8,
        }
    }

    const fn iv_len(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes192Cbc | Self::Aes256Cbc => 16,
            Self::DesEde3Cbc | Self::DesCbc => 8,
        }
    }
}

/// Parsed `DEK-Info` header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct DekInfo {
    pub(super) cipher: LegacyCipher,
    pub(super) iv: Vec<u8>,
}

impl DekInfo {
    /// Parses `CIPHER,HEXIV`.
    pub(super) fn parse(value: &str) -> Result<Self, String> {
        let (name, iv_hex) = value
            .split_once(',')
            .ok_or_else(|| format!("malformed DEK-Info header '{value}'"))?;
        let cipher = LegacyCipher::from_name(name.trim())
            .ok_or_else(|| format!("unsupported PEM cipher '{}'", name.trim()))?;
        let iv = hex::decode(iv_hex.trim()).map_err(|err| format!("invalid PEM IV: {err}"))?;
        if iv.len() != cipher.iv_len() {
            return Err(format!(
                "{} expects a {}-byte IV, found {}",
                cipher.name(),
                cipher.iv_len(),
                iv.len()
            ));
        }
        Ok(Self { cipher, iv })
    }

    fn salt(&self) -> &[u8] {
        self.iv.get(..SALT_LEN).unwrap_or(&self.iv)
    }
}

/// Decrypts the body of an encrypted PEM block.
///
/// A wrong passphrase almost always surfaces here as a padding failure; the
/// rare survivor is caught when the plaintext fails to parse as a key.
pub(super) fn decrypt(
    dek: &DekInfo,
    passphrase: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, String> {
    let key = derive_key(passphrase, dek.salt(), dek.cipher.key_len());
    let plaintext = match dek.cipher {
        LegacyCipher::Aes128Cbc => cbc_decrypt::<aes::Aes128>(&key, &dek.iv, ciphertext),
        LegacyCipher::Aes192Cbc => cbc_decrypt::<aes::Aes192>(&key, &dek.iv, ciphertext),
        LegacyCipher::Aes256Cbc => cbc_decrypt::<aes::Aes256>(&key, &dek.iv, ciphertext),
        LegacyCipher::DesEde3Cbc => cbc_decrypt::<des::TdesEde3>(&key, &dek.iv, ciphertext),
        LegacyCipher::DesCbc => cbc_decrypt::<des::Des>(&key, &dek.iv, ciphertext),
    }?;
    Ok(Zeroizing::new(plaintext))
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|err| format!("invalid key or IV length: {err}"))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| String::from("incorrect passphrase or corrupt key data"))
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration.
pub(super) fn derive_key(passphrase: &[u8], salt: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(len + 16));
    let mut previous: Vec<u8> = Vec::new();
    while key.len() < len {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(passphrase);
        hasher.update(salt);
        previous = hasher.finalize().to_vec();
        key.extend_from_slice(&previous);
    }
    key.truncate(len);
    key
}

#[cfg(test)]
pub(super) fn encrypt_aes128(passphrase: &[u8], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    use cbc::cipher::BlockEncryptMut;

    let (salt, _) = iv.split_at(SALT_LEN);
    let key = derive_key(passphrase, salt, 16);
    cbc::Encryptor::<aes::Aes128>::new_from_slices(&key, iv)
        .unwrap_or_else(|err| panic!("encryptor: {err}"))
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

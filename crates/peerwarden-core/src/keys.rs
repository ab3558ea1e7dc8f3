// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use x25519_dalek::{PublicKey, StaticSecret};

/// Stored in place of ciphertext when an external tool holds the private key.
pub const EXTERNAL_KEY: &str = "EXTERNAL";

/// Length of a base64-encoded 32-byte key.
pub const RAW_KEY_LEN: usize = 44;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("key encryption failed")]
    Encrypt,

    #[error("key decryption failed")]
    Decrypt,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// Identity generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

pub fn generate() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: BASE64.encode(secret.to_bytes()),
        public_key: BASE64.encode(public.as_bytes()),
    }
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], CipherError> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CipherError::InvalidKey(format!("expected 32 bytes, got {len}")))
}

/// Derive the public key that identifies the holder of `private_b64`.
pub fn public_from_private(private_b64: &str) -> Result<String, CipherError> {
    let secret = StaticSecret::from(decode_key(private_b64)?);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}

// ---------------------------------------------------------------------------
// Stored key classification
// ---------------------------------------------------------------------------

/// What the `encrypted_private_key` column actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKey<'a> {
    Encrypted(&'a str),
    External,
    Missing,
    /// A plaintext key that was never encrypted.
    Raw(&'a str),
}

impl<'a> StoredKey<'a> {
    pub fn classify(value: &'a str) -> Self {
        match value {
            "" => Self::Missing,
            EXTERNAL_KEY => Self::External,
            v if v.len() == RAW_KEY_LEN && decode_key(v).is_ok() => Self::Raw(v),
            v => Self::Encrypted(v),
        }
    }

    /// Whether the store lacks a usable copy of the key.
    pub fn is_unheld(self) -> bool {
        matches!(self, Self::External | Self::Missing)
    }
}

// ---------------------------------------------------------------------------
// Encryption at rest
// ---------------------------------------------------------------------------

pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM with a random nonce, stored as base64(nonce || ciphertext).
#[derive(Clone)]
pub struct AesKeyCipher {
    key: [u8; 32],
}

impl AesKeyCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl std::fmt::Debug for AesKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKeyCipher").finish_non_exhaustive()
    }
}

impl KeyCipher for AesKeyCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::Encrypt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let raw = BASE64.decode(ciphertext).map_err(|_| CipherError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Decrypt);
        }
        let (nonce_bytes, body) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::Decrypt)?;
        let nonce =
            Nonce::from_exact_iter(nonce_bytes.iter().copied()).ok_or(CipherError::Decrypt)?;
        let plaintext = cipher.decrypt(&nonce, body).map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Decrypt)
    }
}

/// Recover a plaintext private key from whatever the store holds.
///
/// Returns `None` when the store does not hold the key at all. A value that
/// fails to decrypt but looks like a raw key is returned as-is.
pub fn recover_private_key(
    cipher: &dyn KeyCipher,
    stored: &str,
) -> Result<Option<String>, CipherError> {
    match StoredKey::classify(stored) {
        StoredKey::Missing | StoredKey::External => Ok(None),
        StoredKey::Raw(raw) => Ok(Some(raw.to_string())),
        StoredKey::Encrypted(enc) => cipher.decrypt(enc).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn cipher() -> AesKeyCipher {
        AesKeyCipher::new([7u8; 32])
    }

    #[test]
    fn generated_pair_is_consistent() {
        let pair = generate();
        assert_eq!(pair.private_key.len(), RAW_KEY_LEN);
        assert_eq!(public_from_private(&pair.private_key).unwrap(), pair.public_key);
    }

    #[test]
    fn ciphertext_round_trips_and_is_not_raw_length() {
        let pair = generate();
        let enc = cipher().encrypt(&pair.private_key).unwrap();
        assert_ne!(enc.len(), RAW_KEY_LEN);
        assert_eq!(cipher().decrypt(&enc).unwrap(), pair.private_key);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let enc = cipher().encrypt("secret").unwrap();
        let other = AesKeyCipher::new([8u8; 32]);
        assert!(matches!(other.decrypt(&enc), Err(CipherError::Decrypt)));
    }

    #[test_case("", "missing" ; "empty")]
    #[test_case("EXTERNAL", "external" ; "sentinel")]
    #[test_case("YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=", "raw" ; "raw key")]
    #[test_case("bm90IGEga2V5", "encrypted" ; "other")]
    fn classify_stored_values(value: &str, expected: &str) {
        let kind = match StoredKey::classify(value) {
            StoredKey::Missing => "missing",
            StoredKey::External => "external",
            StoredKey::Raw(_) => "raw",
            StoredKey::Encrypted(_) => "encrypted",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn recover_handles_raw_and_encrypted() {
        let pair = generate();
        let c = cipher();
        let enc = c.encrypt(&pair.private_key).unwrap();
        assert_eq!(
            recover_private_key(&c, &enc).unwrap().as_deref(),
            Some(pair.private_key.as_str())
        );
        assert_eq!(
            recover_private_key(&c, &pair.private_key).unwrap().as_deref(),
            Some(pair.private_key.as_str())
        );
        assert_eq!(recover_private_key(&c, EXTERNAL_KEY).unwrap(), None);
    }
}

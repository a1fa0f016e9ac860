//! Key material for feeds, parties and devices.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Key length in bytes.
pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid key encoding: {0}")]
    InvalidHex(String),
    #[error("Invalid key length: expected {KEY_LENGTH}, got {0}")]
    InvalidLength(usize),
}

/// Public half of a key pair. Identifies feeds, parties and devices.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Random key (tests and ephemeral identities).
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines.
    pub fn truncate(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.truncate())
    }
}

/// Secret half of a key pair. Possession grants write capability on a feed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey([u8; KEY_LENGTH]);

impl SecretKey {
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut public = [0u8; KEY_LENGTH];
        let mut secret = [0u8; KEY_LENGTH];
        rng.fill_bytes(&mut public);
        rng.fill_bytes(&mut secret);
        Self {
            public_key: PublicKey(public),
            secret_key: SecretKey(secret),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = PublicKey::random();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_invalid_length() {
        assert_eq!(
            PublicKey::from_slice(&[1, 2, 3]).unwrap_err(),
            KeyError::InvalidLength(3)
        );
        assert!(matches!(
            PublicKey::from_hex("zz"),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let pair = KeyPair::generate();
        let secret_hex = hex::encode(pair.secret_key.as_bytes());
        assert!(!format!("{:?}", pair.secret_key).contains(&secret_hex));
    }

    #[test]
    fn test_generated_pairs_differ() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key, b.public_key);
    }
}

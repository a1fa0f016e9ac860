//! In-memory keyring.
//!
//! Holds public keys for every known feed/party/device and, where this peer
//! owns the key, its secret half. Feed write capability is decided here.

use echo_util::{KeyPair, PublicKey, SecretKey};
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Identity,
    Device,
    Party,
    Feed,
}

/// Public part of a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub public_key: PublicKey,
    pub key_type: KeyType,
    /// ms since epoch
    pub added_ms: u64,
}

#[derive(Debug, Clone)]
pub struct KeyRecordWithSecret {
    pub record: KeyRecord,
    pub secret_key: SecretKey,
}

impl KeyRecordWithSecret {
    pub fn key_pair(&self) -> KeyPair {
        KeyPair {
            public_key: self.record.public_key,
            secret_key: self.secret_key.clone(),
        }
    }
}

struct Entry {
    record: KeyRecord,
    secret_key: Option<SecretKey>,
}

#[derive(Default)]
pub struct Keyring {
    keys: Mutex<FxHashMap<PublicKey, Entry>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self, key: &PublicKey) -> bool {
        lock(&self.keys).contains_key(key)
    }

    pub fn has_secret_key(&self, key: &PublicKey) -> bool {
        lock(&self.keys)
            .get(key)
            .is_some_and(|entry| entry.secret_key.is_some())
    }

    pub fn get_key(&self, key: &PublicKey) -> Option<KeyRecord> {
        lock(&self.keys).get(key).map(|entry| entry.record.clone())
    }

    /// Record plus secret key, if this peer owns `key`.
    pub fn get_full_key(&self, key: &PublicKey) -> Option<KeyRecordWithSecret> {
        let keys = lock(&self.keys);
        let entry = keys.get(key)?;
        let secret_key = entry.secret_key.clone()?;
        Some(KeyRecordWithSecret {
            record: entry.record.clone(),
            secret_key,
        })
    }

    /// Import a public key. An existing record is kept as is.
    pub fn add_public_key(&self, key: PublicKey, key_type: KeyType) -> KeyRecord {
        let mut keys = lock(&self.keys);
        keys.entry(key)
            .or_insert_with(|| Entry {
                record: KeyRecord {
                    public_key: key,
                    key_type,
                    added_ms: now_ms(),
                },
                secret_key: None,
            })
            .record
            .clone()
    }

    /// Store a full key pair, attaching the secret to an existing public record.
    pub fn add_key_record(&self, pair: &KeyPair, key_type: KeyType) -> KeyRecord {
        let mut keys = lock(&self.keys);
        let entry = keys.entry(pair.public_key).or_insert_with(|| Entry {
            record: KeyRecord {
                public_key: pair.public_key,
                key_type,
                added_ms: now_ms(),
            },
            secret_key: None,
        });
        entry.secret_key = Some(pair.secret_key.clone());
        entry.record.clone()
    }

    /// Generate and store a fresh key pair.
    pub fn create_key_record(&self, key_type: KeyType) -> KeyRecordWithSecret {
        let pair = KeyPair::generate();
        let record = self.add_key_record(&pair, key_type);
        log::debug!("Created {key_type:?} key {}", record.public_key.truncate());
        KeyRecordWithSecret {
            record,
            secret_key: pair.secret_key,
        }
    }

    /// Forget the secret half. Returns whether one was held.
    pub fn delete_secret_key(&self, key: &PublicKey) -> bool {
        lock(&self.keys)
            .get_mut(key)
            .and_then(|entry| entry.secret_key.take())
            .is_some()
    }

    /// All records of a type, sorted by key.
    pub fn find_keys(&self, key_type: KeyType) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> = lock(&self.keys)
            .values()
            .filter(|entry| entry.record.key_type == key_type)
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.public_key);
        records
    }

    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! Persisted record of known parties and their admitted feeds.
//!
//! Stored as one framed bincode blob in the `EchoMetadata` file of the
//! store's directory. Every mutation rewrites the file in a single write.

use echo_util::PublicKey;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;

use crate::lock;
use crate::storage::framing::{self, Frame, HEADER_LEN};
use crate::storage::{Directory, StorageError};

pub const METADATA_FILE: &str = "EchoMetadata";
pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Encoding error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyMetadata {
    pub key: PublicKey,
    /// Admitted feeds in admission order.
    pub feed_keys: Vec<PublicKey>,
    pub genesis_feed_key: Option<PublicKey>,
}

impl PartyMetadata {
    fn new(key: PublicKey) -> Self {
        Self {
            key,
            feed_keys: Vec::new(),
            genesis_feed_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoMetadata {
    pub version: u32,
    pub parties: Vec<PartyMetadata>,
    pub created_ms: u64,
    pub updated_ms: u64,
}

impl Default for EchoMetadata {
    fn default() -> Self {
        let now = now_ms();
        Self {
            version: STORAGE_VERSION,
            parties: Vec::new(),
            created_ms: now,
            updated_ms: now,
        }
    }
}

pub struct MetadataStore {
    directory: Arc<dyn Directory>,
    metadata: Mutex<EchoMetadata>,
}

impl MetadataStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            metadata: Mutex::new(EchoMetadata::default()),
        }
    }

    /// Read the metadata file. A missing or short file yields a fresh
    /// record; a corrupt one is logged and replaced by a fresh record.
    pub fn load(&self) -> Result<(), MetadataError> {
        let file = self.directory.get_or_create_file(METADATA_FILE)?;
        let bytes = file.read_all()?;

        let loaded = if bytes.len() < HEADER_LEN {
            EchoMetadata::default()
        } else {
            match framing::decode(&bytes, 0) {
                Frame::Complete { payload, .. } => match decode_metadata(payload) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        log::warn!("Metadata undecodable, resetting: {err}");
                        EchoMetadata::default()
                    }
                },
                Frame::Truncated => {
                    log::warn!("Metadata file truncated ({} bytes), resetting", bytes.len());
                    EchoMetadata::default()
                }
                Frame::Corrupt => {
                    log::warn!("Metadata checksum mismatch, resetting");
                    EchoMetadata::default()
                }
            }
        };

        log::debug!("Metadata loaded: {} parties", loaded.parties.len());
        *lock(&self.metadata) = loaded;
        Ok(())
    }

    pub fn metadata(&self) -> EchoMetadata {
        lock(&self.metadata).clone()
    }

    pub fn parties(&self) -> Vec<PartyMetadata> {
        lock(&self.metadata).parties.clone()
    }

    pub fn get_party(&self, party_key: &PublicKey) -> Option<PartyMetadata> {
        lock(&self.metadata)
            .parties
            .iter()
            .find(|party| party.key == *party_key)
            .cloned()
    }

    /// Register a party. No-op if it is already known.
    pub fn add_party(&self, party_key: PublicKey) -> Result<(), MetadataError> {
        self.update(|metadata| {
            if metadata.parties.iter().any(|p| p.key == party_key) {
                return false;
            }
            metadata.parties.push(PartyMetadata::new(party_key));
            true
        })
    }

    /// Record `feed_key` as admitted to the party, creating the party record
    /// if needed. No-op if the feed is already listed.
    pub fn add_party_feed(
        &self,
        party_key: PublicKey,
        feed_key: PublicKey,
    ) -> Result<(), MetadataError> {
        self.update(|metadata| {
            let party = party_entry(metadata, party_key);
            if party.feed_keys.contains(&feed_key) {
                return false;
            }
            party.feed_keys.push(feed_key);
            true
        })
    }

    pub fn set_genesis_feed(
        &self,
        party_key: PublicKey,
        feed_key: PublicKey,
    ) -> Result<(), MetadataError> {
        self.update(|metadata| {
            let party = party_entry(metadata, party_key);
            if party.genesis_feed_key == Some(feed_key) {
                return false;
            }
            party.genesis_feed_key = Some(feed_key);
            true
        })
    }

    /// Drop the in-memory record. The file is left untouched.
    pub fn close(&self) {
        *lock(&self.metadata) = EchoMetadata::default();
    }

    fn update(&self, mutate: impl FnOnce(&mut EchoMetadata) -> bool) -> Result<(), MetadataError> {
        let mut metadata = lock(&self.metadata);
        if !mutate(&mut metadata) {
            return Ok(());
        }
        metadata.updated_ms = now_ms();
        self.save(&metadata)
    }

    fn save(&self, metadata: &EchoMetadata) -> Result<(), MetadataError> {
        let payload = bincode::serde::encode_to_vec(metadata, bincode::config::standard())
            .map_err(|e| MetadataError::Encode(e.to_string()))?;
        let frame = framing::encode(&payload);

        let file = self.directory.get_or_create_file(METADATA_FILE)?;
        file.write(0, &frame)?;
        file.truncate(frame.len() as u64)?;
        log::trace!("Metadata saved ({} bytes)", frame.len());
        Ok(())
    }
}

fn party_entry(metadata: &mut EchoMetadata, party_key: PublicKey) -> &mut PartyMetadata {
    let index = match metadata.parties.iter().position(|p| p.key == party_key) {
        Some(index) => index,
        None => {
            metadata.parties.push(PartyMetadata::new(party_key));
            metadata.parties.len() - 1
        }
    };
    &mut metadata.parties[index]
}

fn decode_metadata(payload: &[u8]) -> Result<EchoMetadata, String> {
    let (metadata, _): (EchoMetadata, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| e.to_string())?;
    if metadata.version != STORAGE_VERSION {
        return Err(format!("unsupported version {}", metadata.version));
    }
    Ok(metadata)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

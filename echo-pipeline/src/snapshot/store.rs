//! Snapshot persistence: one file per party, named by the party key.
//!
//! File contents: a single frame whose payload is the LZ4-compressed bincode
//! encoding of the [`PartySnapshot`].

use echo_util::PublicKey;
use std::sync::Arc;

use super::{PartySnapshot, SnapshotError};
use crate::storage::framing::{self, Frame};
use crate::storage::Directory;

pub struct SnapshotStore {
    directory: Arc<dyn Directory>,
}

impl SnapshotStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Persist `snapshot`, replacing any previous one of the same party.
    pub fn save(&self, snapshot: &PartySnapshot) -> Result<(), SnapshotError> {
        let party_key = snapshot.party_key.ok_or(SnapshotError::MissingPartyKey)?;
        let encoded = snapshot.encode()?;
        let frame = framing::encode(&lz4_flex::compress_prepend_size(&encoded));

        let file = self.directory.get_or_create_file(&party_key.to_hex())?;
        file.write(0, &frame)?;
        file.truncate(frame.len() as u64)?;

        log::info!(
            "Saved snapshot of party {} ({} items, {} bytes, {} compressed)",
            party_key.truncate(),
            snapshot.item_count(),
            encoded.len(),
            frame.len()
        );
        Ok(())
    }

    /// Latest snapshot of the party, if one was saved.
    pub fn load(&self, party_key: &PublicKey) -> Result<Option<PartySnapshot>, SnapshotError> {
        let name = party_key.to_hex();
        if !self.directory.list()?.contains(&name) {
            return Ok(None);
        }
        let bytes = self.directory.get_or_create_file(&name)?.read_all()?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let Frame::Complete { payload, .. } = framing::decode(&bytes, 0) else {
            log::warn!("Snapshot of party {} failed verification", party_key.truncate());
            return Err(SnapshotError::Corrupt(*party_key));
        };
        let encoded = lz4_flex::decompress_size_prepended(payload)
            .map_err(|_| SnapshotError::Corrupt(*party_key))?;
        PartySnapshot::decode(&encoded).map(Some)
    }

    /// Parties with a stored snapshot.
    pub fn list(&self) -> Result<Vec<PublicKey>, SnapshotError> {
        Ok(self
            .directory
            .list()?
            .iter()
            .filter_map(|name| PublicKey::from_hex(name).ok())
            .collect())
    }

    /// Remove the party's snapshot. Returns whether one existed.
    pub fn delete(&self, party_key: &PublicKey) -> Result<bool, SnapshotError> {
        let name = party_key.to_hex();
        if !self.directory.list()?.contains(&name) {
            return Ok(false);
        }
        self.directory.get_or_create_file(&name)?.delete()?;
        Ok(true)
    }
}

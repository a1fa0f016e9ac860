//! Database root: the document holding a space's metadata.

use echo_util::PublicKey;
use std::time::{Duration, Instant};
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, Out, Transact, Update};

use super::{DatabaseError, DocHandle, DocumentId};

const METADATA_MAP: &str = "metadata";
const SPACE_KEY: &str = "spaceKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentMetrics {
    /// LZ4 size of the encoded state.
    pub compressed_byte_size: usize,
    /// Time to rebuild a document from the encoded state.
    pub load_time: Duration,
    /// Sum of all client clocks.
    pub mutation_count: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseRoot {
    handle: DocHandle,
}

impl DatabaseRoot {
    pub fn new(handle: DocHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    pub fn document_id(&self) -> DocumentId {
        self.handle.id()
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_ready()
    }

    /// `None` while not loaded or if the key was never set.
    pub fn get_space_key(&self) -> Option<PublicKey> {
        self.handle
            .read(|doc| {
                let map = doc.get_or_insert_map(METADATA_MAP);
                let txn = doc.transact();
                match map.get(&txn, SPACE_KEY) {
                    Some(Out::Any(Any::String(hex))) => PublicKey::from_hex(&hex).ok(),
                    _ => None,
                }
            })
            .ok()
            .flatten()
    }

    /// Store the space key; returns the document update to persist.
    pub fn set_space_key(&self, key: &PublicKey) -> Result<Vec<u8>, DatabaseError> {
        let ((), update) = self.handle.change(|doc| {
            let map = doc.get_or_insert_map(METADATA_MAP);
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, SPACE_KEY, key.to_hex());
        })?;
        Ok(update)
    }

    pub fn measure_metrics(&self) -> Result<DocumentMetrics, DatabaseError> {
        let state = self.handle.encode_state()?;
        let compressed_byte_size = lz4_flex::compress_prepend_size(&state).len();

        let started = Instant::now();
        let update = Update::decode_v1(&state).map_err(|e| DatabaseError::InvalidUpdate {
            id: self.document_id(),
            reason: e.to_string(),
        })?;
        Doc::new()
            .transact_mut()
            .apply_update(update)
            .map_err(|e| DatabaseError::InvalidUpdate {
                id: self.document_id(),
                reason: e.to_string(),
            })?;
        let load_time = started.elapsed();

        Ok(DocumentMetrics {
            compressed_byte_size,
            load_time,
            mutation_count: self.handle.mutation_count()?,
        })
    }
}

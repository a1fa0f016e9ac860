//! Reference to a CRDT document that may or may not be loaded.

use std::sync::{Arc, Mutex};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{DatabaseError, DocumentId};
use crate::lock;

struct HandleInner {
    id: DocumentId,
    doc: Mutex<Option<Doc>>,
}

/// Shared handle; clones refer to the same document.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

impl DocHandle {
    /// Handle without a document value yet.
    pub fn unloaded(id: DocumentId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                doc: Mutex::new(None),
            }),
        }
    }

    /// Handle over an already available document.
    pub fn with_doc(id: DocumentId, doc: Doc) -> Self {
        let handle = Self::unloaded(id);
        handle.set_doc(doc);
        handle
    }

    pub fn id(&self) -> DocumentId {
        self.inner.id
    }

    /// Whether the document value is available synchronously.
    pub fn is_ready(&self) -> bool {
        lock(&self.inner.doc).is_some()
    }

    pub(crate) fn set_doc(&self, doc: Doc) {
        *lock(&self.inner.doc) = Some(doc);
    }

    /// Run `read` against the loaded document.
    pub fn read<R>(&self, read: impl FnOnce(&Doc) -> R) -> Result<R, DatabaseError> {
        let guard = lock(&self.inner.doc);
        let doc = guard.as_ref().ok_or(DatabaseError::NotLoaded(self.inner.id))?;
        Ok(read(doc))
    }

    /// Run `edit` and return its result together with the update it produced.
    pub fn change<R>(&self, edit: impl FnOnce(&Doc) -> R) -> Result<(R, Vec<u8>), DatabaseError> {
        self.read(|doc| {
            let before = doc.transact().state_vector();
            let result = edit(doc);
            let update = doc.transact().encode_state_as_update_v1(&before);
            (result, update)
        })
    }

    /// Merge a remote update.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), DatabaseError> {
        let id = self.inner.id;
        let invalid = |reason: String| DatabaseError::InvalidUpdate { id, reason };
        let update = Update::decode_v1(bytes).map_err(|e| invalid(e.to_string()))?;
        self.read(|doc| doc.transact_mut().apply_update(update))?
            .map_err(|e| invalid(e.to_string()))
    }

    /// Full state as a single v1 update.
    pub fn encode_state(&self) -> Result<Vec<u8>, DatabaseError> {
        self.read(|doc| {
            doc.transact()
                .encode_state_as_update_v1(&StateVector::default())
        })
    }

    /// Sum of all client clocks in the state vector.
    pub fn mutation_count(&self) -> Result<u64, DatabaseError> {
        self.read(|doc| {
            doc.transact()
                .state_vector()
                .iter()
                .map(|(_, clock)| u64::from(*clock))
                .sum()
        })
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.inner.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

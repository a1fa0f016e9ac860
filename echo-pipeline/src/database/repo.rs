//! Document repository: hands out [`DocHandle`]s and moves them in and out
//! of the [`DocumentStore`].

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use yrs::Doc;

use super::{DatabaseError, DocHandle, DocumentId};
use crate::lock;
use crate::storage::{DocumentStore, StoreError};

pub struct DocumentRepo {
    store: Option<Arc<DocumentStore>>,
    handles: Mutex<FxHashMap<DocumentId, DocHandle>>,
}

impl DocumentRepo {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store: Some(store),
            handles: Mutex::new(FxHashMap::default()),
        }
    }

    /// Repository without persistence; loads always produce empty documents.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            handles: Mutex::new(FxHashMap::default()),
        }
    }

    /// New, already loaded, empty document.
    pub fn create(&self) -> DocHandle {
        let handle = DocHandle::with_doc(DocumentId::new(), Doc::new());
        lock(&self.handles).insert(handle.id(), handle.clone());
        log::debug!("Created document {}", handle.id());
        handle
    }

    /// Handle for `id`. Not loaded unless it was loaded before.
    pub fn find(&self, id: DocumentId) -> DocHandle {
        lock(&self.handles)
            .entry(id)
            .or_insert_with(|| DocHandle::unloaded(id))
            .clone()
    }

    /// Make the handle's document available: stored state plus pending
    /// updates, or an empty document if nothing was stored.
    pub fn load(&self, handle: &DocHandle) -> Result<(), DatabaseError> {
        if handle.is_ready() {
            return Ok(());
        }

        let doc = Doc::new();
        let loaded = DocHandle::with_doc(handle.id(), doc.clone());
        if let Some(store) = &self.store {
            let uuid = handle.id().as_uuid();
            match store.load_document(uuid) {
                Ok(state) => loaded.apply_update(&state)?,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            let updates = store.load_updates(uuid)?;
            for (_, update) in &updates {
                loaded.apply_update(update)?;
            }
            log::debug!(
                "Loaded document {} with {} pending updates",
                handle.id(),
                updates.len()
            );
        }

        handle.set_doc(doc);
        Ok(())
    }

    /// Record an incremental update produced by [`DocHandle::change`].
    pub fn append_update(&self, handle: &DocHandle, update: &[u8]) -> Result<(), DatabaseError> {
        if let Some(store) = &self.store {
            store.append_update(handle.id().as_uuid(), update)?;
        }
        Ok(())
    }

    /// Persist the full document state, folding pending updates.
    pub fn flush(&self, handle: &DocHandle) -> Result<(), DatabaseError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let uuid = handle.id().as_uuid();
        // Updates appended from here on may be missing from `state`.
        let before = store.next_update_seq(uuid)?;
        let state = handle.encode_state()?;
        store.compact_before(uuid, &state, before)?;
        Ok(())
    }

    /// Stored document ids.
    pub fn list(&self) -> Result<Vec<DocumentId>, DatabaseError> {
        match &self.store {
            Some(store) => Ok(store
                .list_documents()?
                .into_iter()
                .map(DocumentId::from_uuid)
                .collect()),
            None => Ok(lock(&self.handles).keys().copied().collect()),
        }
    }
}

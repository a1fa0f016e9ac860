//! Tracks which document is the database root of each space.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

use super::{DatabaseRoot, DocHandle, DocumentId, SpaceId};
use crate::lock;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpaceStateError {
    #[error("Space state manager is disposed")]
    Disposed,
}

/// Emitted whenever a space's root document changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootUpdate {
    pub space_id: SpaceId,
    pub document_id: DocumentId,
}

struct ManagerState {
    roots: FxHashMap<DocumentId, Arc<DatabaseRoot>>,
    space_roots: BTreeMap<SpaceId, DocumentId>,
    updates: Option<broadcast::Sender<RootUpdate>>,
}

pub struct SpaceStateManager {
    state: Mutex<ManagerState>,
}

impl Default for SpaceStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceStateManager {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ManagerState {
                roots: FxHashMap::default(),
                space_roots: BTreeMap::new(),
                updates: Some(updates),
            }),
        }
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut ManagerState) -> R,
    ) -> Result<R, SpaceStateError> {
        let mut state = lock(&self.state);
        if state.updates.is_none() {
            return Err(SpaceStateError::Disposed);
        }
        Ok(f(&mut state))
    }

    /// Root for the handle's document. Opening the same document twice
    /// returns the same root.
    pub fn open_root(&self, handle: DocHandle) -> Result<Arc<DatabaseRoot>, SpaceStateError> {
        self.with_state(|state| {
            state
                .roots
                .entry(handle.id())
                .or_insert_with(|| Arc::new(DatabaseRoot::new(handle)))
                .clone()
        })
    }

    /// Point `space_id` at `document_id`. The last assignment wins.
    pub fn set_space_root(
        &self,
        space_id: SpaceId,
        document_id: DocumentId,
    ) -> Result<(), SpaceStateError> {
        self.with_state(|state| {
            let previous = state.space_roots.insert(space_id.clone(), document_id);
            if previous == Some(document_id) {
                return;
            }
            log::debug!("Space {space_id} root is now {document_id}");
            if let Some(updates) = &state.updates {
                // No receivers is fine.
                let _ = updates.send(RootUpdate {
                    space_id,
                    document_id,
                });
            }
        })
    }

    pub fn get_space_root(
        &self,
        space_id: &SpaceId,
    ) -> Result<Option<DocumentId>, SpaceStateError> {
        self.with_state(|state| state.space_roots.get(space_id).copied())
    }

    /// The opened root of a space, if both the mapping and the root exist.
    pub fn get_root_by_space(
        &self,
        space_id: &SpaceId,
    ) -> Result<Option<Arc<DatabaseRoot>>, SpaceStateError> {
        self.with_state(|state| {
            state
                .space_roots
                .get(space_id)
                .and_then(|id| state.roots.get(id))
                .cloned()
        })
    }

    pub fn roots(&self) -> Result<Vec<Arc<DatabaseRoot>>, SpaceStateError> {
        self.with_state(|state| state.roots.values().cloned().collect())
    }

    pub fn spaces(&self) -> Result<Vec<SpaceId>, SpaceStateError> {
        self.with_state(|state| state.space_roots.keys().cloned().collect())
    }

    pub fn subscribe_root_updates(
        &self,
    ) -> Result<broadcast::Receiver<RootUpdate>, SpaceStateError> {
        self.with_state(|state| state.updates.as_ref().map(broadcast::Sender::subscribe))?
            .ok_or(SpaceStateError::Disposed)
    }

    /// Drop all roots and close subscriptions. Later calls fail with
    /// [`SpaceStateError::Disposed`].
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        state.roots.clear();
        state.space_roots.clear();
        if state.updates.take().is_some() {
            log::debug!("Space state manager disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.state).updates.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn handle() -> DocHandle {
        DocHandle::unloaded(DocumentId::new())
    }

    #[test]
    fn test_open_root_is_idempotent() {
        let manager = SpaceStateManager::new();
        let handle = handle();
        let first = manager.open_root(handle.clone()).unwrap();
        let second = manager.open_root(handle).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.roots().unwrap().len(), 1);
    }

    #[test]
    fn test_space_root_mapping() {
        let manager = SpaceStateManager::new();
        let space = SpaceId::from("space-a");
        assert_eq!(manager.get_space_root(&space).unwrap(), None);

        let root = manager.open_root(handle()).unwrap();
        manager.set_space_root(space.clone(), root.document_id()).unwrap();
        assert_eq!(manager.get_space_root(&space).unwrap(), Some(root.document_id()));
        let found = manager.get_root_by_space(&space).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &root));

        let other = DocumentId::new();
        manager.set_space_root(space.clone(), other).unwrap();
        assert_eq!(manager.get_space_root(&space).unwrap(), Some(other));
        assert!(manager.get_root_by_space(&space).unwrap().is_none());
        assert_eq!(manager.spaces().unwrap(), vec![space]);
    }

    #[tokio::test]
    async fn test_root_updates_broadcast() {
        let manager = SpaceStateManager::new();
        let mut updates = manager.subscribe_root_updates().unwrap();
        let space = SpaceId::from("space-b");
        let doc = DocumentId::new();

        manager.set_space_root(space.clone(), doc).unwrap();
        // Same mapping again is not an update.
        manager.set_space_root(space.clone(), doc).unwrap();

        assert_eq!(
            updates.recv().await.unwrap(),
            RootUpdate {
                space_id: space,
                document_id: doc
            }
        );
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispose() {
        let manager = SpaceStateManager::new();
        let mut updates = manager.subscribe_root_updates().unwrap();
        manager.open_root(handle()).unwrap();

        manager.dispose();
        assert!(manager.is_disposed());
        assert!(matches!(updates.recv().await, Err(RecvError::Closed)));
        assert_eq!(manager.roots().unwrap_err(), SpaceStateError::Disposed);
        assert_eq!(
            manager.open_root(handle()).unwrap_err(),
            SpaceStateError::Disposed
        );
        assert_eq!(
            manager.subscribe_root_updates().unwrap_err(),
            SpaceStateError::Disposed
        );
        manager.dispose();
    }
}

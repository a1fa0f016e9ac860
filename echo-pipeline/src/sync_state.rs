//! Replication progress against remote peers.
//!
//! Counters are reported per peer per space; [`SyncStateSummary`] folds them
//! into one cluster-wide view and is recomputed on each observation.

use serde::{Deserialize, Serialize};

use crate::database::SpaceId;

pub type PeerId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncState {
    pub peer_id: PeerId,
    /// Documents the remote has that we lack.
    pub missing_on_local: u64,
    /// Documents we have that the remote lacks.
    pub missing_on_remote: u64,
    /// Documents present on both sides with diverging heads.
    pub different_documents: u64,
    pub local_document_count: u64,
    pub remote_document_count: u64,
}

impl PeerSyncState {
    pub fn is_synced(&self) -> bool {
        self.missing_on_local == 0 && self.missing_on_remote == 0 && self.different_documents == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSyncState {
    pub space_id: SpaceId,
    pub peers: Vec<PeerSyncState>,
}

impl SpaceSyncState {
    pub fn new(space_id: SpaceId) -> Self {
        Self {
            space_id,
            peers: Vec::new(),
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerSyncState> {
        self.peers.iter().find(|peer| peer.peer_id == peer_id)
    }

    /// Replace the counters reported for `state.peer_id`.
    pub fn update_peer(&mut self, state: PeerSyncState) {
        match self.peers.iter_mut().find(|peer| peer.peer_id == state.peer_id) {
            Some(existing) => *existing = state,
            None => self.peers.push(state),
        }
    }

    /// False for peers that never reported.
    pub fn is_synced_with(&self, peer_id: &str) -> bool {
        self.peer(peer_id).is_some_and(PeerSyncState::is_synced)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateSummary {
    pub missing_on_local: u64,
    pub missing_on_remote: u64,
    pub different_documents: u64,
    /// Per space the largest count any peer saw locally, summed over spaces.
    pub local_document_count: u64,
    pub remote_document_count: u64,
    pub peer_count: usize,
}

impl SyncStateSummary {
    pub fn from_spaces<'a>(spaces: impl IntoIterator<Item = &'a SpaceSyncState>) -> Self {
        let mut summary = Self::default();
        for space in spaces {
            let mut local_max = 0;
            for peer in &space.peers {
                summary.missing_on_local += peer.missing_on_local;
                summary.missing_on_remote += peer.missing_on_remote;
                summary.different_documents += peer.different_documents;
                summary.remote_document_count += peer.remote_document_count;
                summary.peer_count += 1;
                local_max = local_max.max(peer.local_document_count);
            }
            summary.local_document_count += local_max;
        }
        summary
    }

    pub fn is_synced(&self) -> bool {
        self.missing_on_local == 0 && self.missing_on_remote == 0 && self.different_documents == 0
    }
}

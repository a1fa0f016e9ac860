//! Party snapshots: wire format, live item state and persistence.
//!
//! ```text
//!  PartyState ── create_snapshot ──► PartySnapshot ── encode ──► bytes
//!      ▲                                                           │
//!      └──── restore_from_snapshot ◄── decode ◄── SnapshotStore ◄──┘
//! ```
//!
//! `model.custom` is opaque here; only the model's registered codec can read
//! it. Items whose model has no snapshot form carry their mutation history in
//! `model.mutations` and are rebuilt by replaying it.

pub mod state;
pub mod store;

use echo_util::{PublicKey, Timeframe};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelError;
use crate::storage::StorageError;

pub use state::{Item, ItemError, ItemId, PartyState};
pub use store::SnapshotStore;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Model type not registered: {0}")]
    UnknownModel(String),
    #[error("Item {item} references missing parent {parent}")]
    MissingParent { item: ItemId, parent: ItemId },
    #[error("Duplicate item in snapshot: {0}")]
    DuplicateItem(ItemId),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Snapshot codec error: {0}")]
    Codec(String),
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("Snapshot has no party key")]
    MissingPartyKey,
    #[error("Corrupt snapshot for party {0:?}")]
    Corrupt(PublicKey),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Codec-specific state, if the model has a snapshot form.
    pub custom: Option<Vec<u8>>,
    /// Mutation history, used when `custom` is absent.
    pub mutations: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: ItemId,
    pub item_type: Option<String>,
    pub model_type: String,
    pub parent_id: Option<ItemId>,
    pub model: ModelSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    /// Parents always precede their children.
    pub items: Vec<ItemSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaloStateSnapshot {
    pub messages: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySnapshot {
    pub version: u32,
    pub party_key: Option<PublicKey>,
    pub timeframe: Timeframe,
    pub database: DatabaseSnapshot,
    pub halo: HaloStateSnapshot,
}

impl Default for PartySnapshot {
    /// The empty snapshot: no items, no halo messages, nothing processed.
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            party_key: None,
            timeframe: Timeframe::new(),
            database: DatabaseSnapshot::default(),
            halo: HaloStateSnapshot::default(),
        }
    }
}

impl PartySnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SnapshotError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let (snapshot, _): (PartySnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| SnapshotError::Codec(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    pub fn item_count(&self) -> usize {
        self.database.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database.items.is_empty() && self.halo.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_codec() {
        let empty = PartySnapshot::default();
        assert!(empty.is_empty());
        let decoded = PartySnapshot::decode(&empty.encode().unwrap()).unwrap();
        assert_eq!(decoded, empty);
    }

    #[test]
    fn test_custom_payload_is_opaque_bytes() {
        let feed = PublicKey::random();
        let snapshot = PartySnapshot {
            party_key: Some(PublicKey::random()),
            timeframe: Timeframe::from_entries([(feed, 7)]),
            database: DatabaseSnapshot {
                items: vec![ItemSnapshot {
                    item_id: "item-1".into(),
                    item_type: Some("task".into()),
                    model_type: "any".into(),
                    parent_id: None,
                    model: ModelSnapshot {
                        custom: Some(vec![0, 159, 146, 150]),
                        mutations: Vec::new(),
                    },
                }],
            },
            halo: HaloStateSnapshot {
                messages: vec![b"credential".to_vec()],
            },
            ..PartySnapshot::default()
        };

        let decoded = PartySnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.timeframe.get(&feed), Some(7));
        assert_eq!(
            decoded.database.items[0].model.custom.as_deref(),
            Some(&[0u8, 159, 146, 150][..])
        );
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let future = PartySnapshot {
            version: SNAPSHOT_VERSION + 1,
            ..PartySnapshot::default()
        };
        assert!(matches!(
            PartySnapshot::decode(&future.encode().unwrap()),
            Err(SnapshotError::UnsupportedVersion(v)) if v == SNAPSHOT_VERSION + 1
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            PartySnapshot::decode(&[0xFF; 3]),
            Err(SnapshotError::Codec(_))
        ));
    }
}

//! CRDT documents backing each space's database root.
//!
//! ```text
//!  SpaceStateManager ── SpaceId → DocumentId
//!        │
//!        ▼
//!  DatabaseRoot ──► DocHandle (yrs::Doc, maybe not loaded yet)
//!                        ▲
//!  DocumentRepo ── load / flush ──► DocumentStore (RocksDB)
//! ```

pub mod doc_handle;
pub mod repo;
pub mod root;
pub mod space_state;

use echo_util::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

pub use doc_handle::DocHandle;
pub use repo::DocumentRepo;
pub use root::{DatabaseRoot, DocumentMetrics};
pub use space_state::{RootUpdate, SpaceStateError, SpaceStateManager};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Document {0} is not loaded")]
    NotLoaded(DocumentId),
    #[error("Invalid document update for {id}: {reason}")]
    InvalidUpdate { id: DocumentId, reason: String },
    #[error("Invalid document id: {0}")]
    InvalidId(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Identifier of a CRDT document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc:{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("doc:").unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| DatabaseError::InvalidId(s.to_string()))
    }
}

/// Logical space identifier, derived from the space key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceId(String);

impl SpaceId {
    /// Hex of the first 16 bytes of the key.
    pub fn from_key(key: &PublicKey) -> Self {
        Self(hex::encode(&key.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_display_and_parse() {
        let id = DocumentId::new();
        let text = id.to_string();
        assert!(text.starts_with("doc:"));
        assert_eq!(text.parse::<DocumentId>().unwrap(), id);
        assert_eq!(id.as_uuid().to_string().parse::<DocumentId>().unwrap(), id);
        assert!("doc:nope".parse::<DocumentId>().is_err());
    }

    #[test]
    fn test_space_id_from_key() {
        let key = PublicKey::from_bytes([0xAB; 32]);
        let space = SpaceId::from_key(&key);
        assert_eq!(space.as_str().len(), 32);
        assert_eq!(space.as_str(), "ab".repeat(16));
    }
}

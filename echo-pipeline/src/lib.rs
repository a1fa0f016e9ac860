//! # echo-pipeline: Replicated object storage for Echo
//!
//! Feed-based replication, CRDT database roots, snapshots and storage
//! instrumentation on top of a byte-addressable file abstraction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  append   ┌──────────────┐  merge   ┌──────────────────┐
//! │ PartyPipeline│ ────────► │ Feed (per    │ ───────► │ FeedStoreIterator│
//! │ (writer)     │           │ key, framed) │          │ (selector)       │
//! └──────┬───────┘           └──────┬───────┘          └────────┬─────────┘
//!        │                          │                           │
//!        ▼                          ▼                           ▼
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────────┐
//! │ SnapshotStore│ ◄──────── │ Directory /  │          │ PartyState       │
//! │ (LZ4 frames) │           │ File (mem,   │          │ (items, models,  │
//! └──────────────┘           │ disk, moni-  │          │ timeframe)       │
//!                            │ tored)       │          └──────────────────┘
//!                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: File/Directory backends, framing, RocksDB document store
//! - [`monitor`]: Per-resource storage statistics
//! - [`keyring`] / [`metadata`]: Keys and persisted party records
//! - [`feed`]: Append-only feeds and the merged iterator
//! - [`party`]: Feed provider and processing pipeline
//! - [`model`]: Model trait, codec registry, built-in models
//! - [`snapshot`]: Snapshot wire format, item state, persistence
//! - [`database`]: Database roots and space → root tracking
//! - [`sync_state`]: Replication progress summary

pub mod database;
pub mod feed;
pub mod keyring;
pub mod metadata;
pub mod model;
pub mod monitor;
pub mod party;
pub mod snapshot;
pub mod storage;
pub mod sync_state;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports for convenience
pub use database::{
    DatabaseError, DatabaseRoot, DocHandle, DocumentId, DocumentMetrics, DocumentRepo, RootUpdate,
    SpaceId, SpaceStateError, SpaceStateManager,
};
pub use feed::{
    Feed, FeedBlock, FeedError, FeedStore, FeedStoreIterator, IteratorConfig, IteratorError,
    MessageSelector, StallEvent,
};
pub use keyring::{KeyRecord, KeyRecordWithSecret, KeyType, Keyring};
pub use metadata::{EchoMetadata, MetadataError, MetadataStore, PartyMetadata};
pub use model::{Model, ModelCodec, ModelError, ModelRegistry, ModelType};
pub use monitor::{
    MetricsSink, MonitorConfig, OpHandle, OpStats, OpType, StatsBucket, StorageMonitor,
};
pub use party::{
    EchoEnvelope, FeedMessage, PartyFeedProvider, PartyPipeline, Payload, PipelineConfig,
    PipelineError, ProviderError,
};
pub use snapshot::{PartySnapshot, PartyState, SnapshotError, SnapshotStore};
pub use storage::{
    Directory, DiskStorage, DocumentStore, File, FileStat, MemoryStorage, StorageError,
    StoreConfig, StoreError,
};
pub use sync_state::{PeerSyncState, SpaceSyncState, SyncStateSummary};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

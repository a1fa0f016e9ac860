//! RocksDB-backed store for CRDT documents.
//!
//! Column families:
//! - `documents`: full document state (LZ4 compressed), keyed by uuid
//! - `updates`: incremental updates (LZ4 compressed), keyed `uuid ++ seq_be`
//! - `metadata`: per-document bookkeeping (bincode)
//!
//! Loading a document means: state from `documents`, then every entry of
//! `updates` in sequence order. `compact` folds the updates back into a fresh
//! state and drops them in one batch.
//!
//! Every write that reads metadata first runs under `writes`, so concurrent
//! appends to one document never share a sequence number.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use crate::lock;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

const UUID_LEN: usize = 16;
const UPDATE_KEY_LEN: usize = UUID_LEN + 8;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("echo_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Sequence number the next appended update receives.
    pub next_update_seq: u64,
    /// Updates currently stored (reset by `compact`).
    pub update_count: u64,
    /// Uncompressed state size in bytes
    pub state_size: u64,
    /// Compressed state size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            next_update_seq: 0,
            update_count: 0,
            state_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writes: Mutex<()>,
}

impl DocumentStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::debug!("DocumentStore opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            writes: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_DOCUMENTS | CF_UPDATES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        if name == CF_UPDATES {
            opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(UUID_LEN));
        }

        opts
    }

    /// Replace the stored state of a document.
    pub fn save_document(
        &self,
        doc_id: Uuid,
        state: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let _writes = lock(&self.writes);
        let mut meta = self.metadata_or_new(doc_id)?;
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Stored state of a document, without pending updates.
    pub fn load_document(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// Append an incremental update. Returns the sequence number assigned.
    pub fn append_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(update);

        let _writes = lock(&self.writes);
        let mut meta = self.metadata_or_new(doc_id)?;
        let seq = meta.next_update_seq;
        meta.next_update_seq += 1;
        meta.update_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, update_key(doc_id, seq), compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    /// All pending updates of a document in sequence order.
    pub fn load_updates(&self, doc_id: Uuid) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut updates = Vec::new();

        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            let Some(seq) = parse_update_key(doc_id, &key) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }

        Ok(updates)
    }

    /// Replace the state with `state` and drop every pending update, atomically.
    /// Returns the number of updates removed.
    pub fn compact(&self, doc_id: Uuid, state: &[u8]) -> Result<u64, StoreError> {
        self.compact_before(doc_id, state, u64::MAX)
    }

    /// Like [`compact`](Self::compact), but only drops updates with a sequence
    /// below `before_seq`. `state` must already contain those updates; later
    /// ones stay pending.
    pub fn compact_before(
        &self,
        doc_id: Uuid,
        state: &[u8],
        before_seq: u64,
    ) -> Result<u64, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let _writes = lock(&self.writes);
        let mut meta = self.metadata_or_new(doc_id)?;

        let mut batch = WriteBatch::default();
        let removed = self.delete_updates_before(doc_id, before_seq, &mut batch)?;

        meta.update_count = meta.update_count.saturating_sub(removed);
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        batch.put_cf(cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!("Compacted document {doc_id}: {removed} updates folded");
        Ok(removed)
    }

    /// Sequence number the next appended update of `doc_id` will receive.
    pub fn next_update_seq(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.metadata_or_new(doc_id)?.next_update_seq)
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, doc_id.as_bytes())?.is_some())
    }

    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; UUID_LEN] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid uuid key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// Remove state, updates and metadata of a document.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _writes = lock(&self.writes);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        self.delete_updates_before(doc_id, u64::MAX, &mut batch)?;
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn delete_updates_before(
        &self,
        doc_id: Uuid,
        before_seq: u64,
        batch: &mut WriteBatch,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            match parse_update_key(doc_id, &key) {
                Some(seq) if seq < before_seq => {}
                _ => break,
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }

    fn metadata_or_new(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

fn update_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(UPDATE_KEY_LEN);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Sequence number of an update key belonging to `doc_id`.
fn parse_update_key(doc_id: Uuid, key: &[u8]) -> Option<u64> {
    if key.len() != UPDATE_KEY_LEN || &key[..UUID_LEN] != doc_id.as_bytes() {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&key[UUID_LEN..]);
    Some(u64::from_be_bytes(seq))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

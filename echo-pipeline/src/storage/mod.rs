//! Byte-addressable storage backends.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ FeedStore    │   │ MetadataStore│   │ SnapshotStore │
//! └──────┬───────┘   └──────┬───────┘   └──────┬────────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                  ┌──────────────────┐
//!                  │ MonitoredDirectory│ ── StorageMonitor (optional)
//!                  └────────┬─────────┘
//!                ┌──────────┴──────────┐
//!                ▼                     ▼
//!        ┌──────────────┐      ┌──────────────┐
//!        │ MemoryStorage│      │ DiskStorage  │
//!        └──────────────┘      └──────────────┘
//!
//! ┌──────────────┐
//! │ DocumentStore│  RocksDB, CRDT root documents (see `rocks`)
//! └──────────────┘
//! ```

pub mod disk;
pub mod framing;
pub mod memory;
pub mod monitored;
pub mod rocks;

use std::sync::Arc;
use thiserror::Error;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use monitored::{MonitoredDirectory, MonitoredFile};
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Read out of range: {file} offset {offset} length {length} (size {size})")]
    OutOfRange {
        file: String,
        offset: u64,
        length: usize,
        size: u64,
    },
    #[error("File deleted: {0}")]
    Deleted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: u64,
}

/// Random-access file.
pub trait File: Send + Sync {
    /// Path of the file relative to the storage root.
    fn filename(&self) -> &str;

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError>;

    /// Write `data` at `offset`, growing the file with zeros if needed.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn stat(&self) -> Result<FileStat, StorageError>;

    fn truncate(&self, length: u64) -> Result<(), StorageError>;

    fn delete(&self) -> Result<(), StorageError>;

    /// Read the whole file.
    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let size = self.stat()?.size;
        self.read(0, size as usize)
    }
}

/// Directory of files.
pub trait Directory: Send + Sync {
    fn path(&self) -> &str;

    /// Names of the files directly inside this directory.
    fn list(&self) -> Result<Vec<String>, StorageError>;

    fn get_or_create_file(&self, name: &str) -> Result<Arc<dyn File>, StorageError>;

    fn create_directory(&self, name: &str) -> Arc<dyn Directory>;

    /// Delete every file under this directory.
    fn delete(&self) -> Result<(), StorageError>;
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Behaviour every backend must share.
    pub(crate) fn exercise_directory(root: Arc<dyn Directory>) {
        let dir = root.create_directory("blueprint");
        let file = dir.get_or_create_file("data").unwrap();
        assert_eq!(file.stat().unwrap().size, 0);

        file.write(0, b"hello").unwrap();
        file.write(5, b" world").unwrap();
        assert_eq!(file.read(0, 11).unwrap(), b"hello world");
        assert_eq!(file.read(6, 5).unwrap(), b"world");
        assert_eq!(file.stat().unwrap().size, 11);

        // Overwrite in place.
        file.write(0, b"HELLO").unwrap();
        assert_eq!(file.read_all().unwrap(), b"HELLO world");

        // Sparse write pads with zeros.
        file.write(13, b"!").unwrap();
        assert_eq!(file.read(11, 3).unwrap(), vec![0, 0, b'!']);

        assert!(matches!(
            file.read(10, 10),
            Err(StorageError::OutOfRange { .. })
        ));

        file.truncate(5).unwrap();
        assert_eq!(file.read_all().unwrap(), b"HELLO");

        // Same handle contents visible through a second open.
        let again = dir.get_or_create_file("data").unwrap();
        assert_eq!(again.read_all().unwrap(), b"HELLO");

        dir.get_or_create_file("other").unwrap().write(0, b"x").unwrap();
        let mut names = dir.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["data".to_string(), "other".to_string()]);

        file.delete().unwrap();
        assert_eq!(dir.list().unwrap(), vec!["other".to_string()]);

        dir.delete().unwrap();
        assert!(dir.list().unwrap().is_empty());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
    }
}

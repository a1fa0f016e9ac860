//! Append-only feeds and the per-process feed store.
//!
//! A feed is persisted as a file named after its hex key, holding framed
//! blocks back to back (see [`crate::storage::framing`]). Opening a feed
//! replays the file into memory; a torn or corrupt tail is cut off.
//!
//! ```text
//! FeedStore ──► Feed (one handle per key) ──► File "<hex key>"
//!                 │
//!                 └─ watch::Sender<u64> (length) ──► FeedStoreIterator
//! ```

pub mod iterator;

use echo_util::{PublicKey, SecretKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

use crate::lock;
use crate::storage::framing::{self, Frame};
use crate::storage::{Directory, File, StorageError};

pub use iterator::{
    first_candidate, FeedStoreIterator, IteratorCloser, IteratorConfig, IteratorError,
    MessageSelector, StallEvent,
};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Feed {0:?} is read-only")]
    ReadOnly(PublicKey),
    #[error("Feed {0:?} is closed")]
    Closed(PublicKey),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One message of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedBlock {
    pub feed_key: PublicKey,
    pub seq: u64,
    pub data: Vec<u8>,
}

struct FeedState {
    blocks: Vec<Vec<u8>>,
    write_offset: u64,
    closed: bool,
}

pub struct Feed {
    key: PublicKey,
    secret_key: Mutex<Option<SecretKey>>,
    file: Arc<dyn File>,
    state: Mutex<FeedState>,
    length: watch::Sender<u64>,
}

impl Feed {
    /// Open a feed over `file`, replaying whatever it already holds.
    pub fn open(
        key: PublicKey,
        secret_key: Option<SecretKey>,
        file: Arc<dyn File>,
    ) -> Result<Arc<Self>, FeedError> {
        let bytes = file.read_all()?;
        let mut blocks = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            match framing::decode(&bytes, offset) {
                Frame::Complete { payload, next } => {
                    blocks.push(payload.to_vec());
                    offset = next;
                }
                Frame::Truncated | Frame::Corrupt => {
                    log::warn!(
                        "Feed {} damaged at offset {offset}: dropping {} trailing bytes",
                        key.truncate(),
                        bytes.len() - offset
                    );
                    file.truncate(offset as u64)?;
                    break;
                }
            }
        }

        log::debug!(
            "Opened feed {} ({} blocks, {})",
            key.truncate(),
            blocks.len(),
            if secret_key.is_some() { "writable" } else { "read-only" }
        );

        let (length, _) = watch::channel(blocks.len() as u64);
        Ok(Arc::new(Self {
            key,
            secret_key: Mutex::new(secret_key),
            file,
            state: Mutex::new(FeedState {
                blocks,
                write_offset: offset as u64,
                closed: false,
            }),
            length,
        }))
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn is_writable(&self) -> bool {
        lock(&self.secret_key).is_some()
    }

    /// Grant write capability.
    pub fn set_secret_key(&self, secret_key: SecretKey) {
        *lock(&self.secret_key) = Some(secret_key);
    }

    /// Append a block and wake iterators. Returns its sequence number.
    pub fn append(&self, data: &[u8]) -> Result<u64, FeedError> {
        if !self.is_writable() {
            return Err(FeedError::ReadOnly(self.key));
        }
        let mut state = lock(&self.state);
        if state.closed {
            return Err(FeedError::Closed(self.key));
        }

        let frame = framing::encode(data);
        self.file.write(state.write_offset, &frame)?;
        state.write_offset += frame.len() as u64;
        state.blocks.push(data.to_vec());

        let seq = state.blocks.len() as u64 - 1;
        self.length.send_replace(state.blocks.len() as u64);
        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Option<FeedBlock> {
        let state = lock(&self.state);
        let data = state.blocks.get(usize::try_from(seq).ok()?)?.clone();
        Some(FeedBlock {
            feed_key: self.key,
            seq,
            data,
        })
    }

    pub fn length(&self) -> u64 {
        lock(&self.state).blocks.len() as u64
    }

    /// Receiver that observes the feed length after every append.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.length.subscribe()
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.key)
            .field("length", &self.length())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Open feeds of this process, one handle per key.
pub struct FeedStore {
    directory: Arc<dyn Directory>,
    feeds: Mutex<BTreeMap<PublicKey, Arc<Feed>>>,
}

impl FeedStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            feeds: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or return the cached handle for) `key`. Passing a secret key
    /// upgrades an existing read-only handle.
    pub fn open_feed(
        &self,
        key: PublicKey,
        secret_key: Option<SecretKey>,
    ) -> Result<Arc<Feed>, FeedError> {
        let mut feeds = lock(&self.feeds);
        if let Some(feed) = feeds.get(&key) {
            if let Some(secret_key) = secret_key {
                if !feed.is_writable() {
                    log::debug!("Feed {} upgraded to writable", key.truncate());
                    feed.set_secret_key(secret_key);
                }
            }
            return Ok(feed.clone());
        }

        let file = self.directory.get_or_create_file(&key.to_hex())?;
        let feed = Feed::open(key, secret_key, file)?;
        feeds.insert(key, feed.clone());
        Ok(feed)
    }

    pub fn get_feed(&self, key: &PublicKey) -> Option<Arc<Feed>> {
        lock(&self.feeds).get(key).cloned()
    }

    pub fn feeds(&self) -> Vec<Arc<Feed>> {
        lock(&self.feeds).values().cloned().collect()
    }

    /// Close every feed and forget the handles.
    pub fn close(&self) {
        let mut feeds = lock(&self.feeds);
        for feed in feeds.values() {
            feed.close();
        }
        log::debug!("FeedStore closed ({} feeds)", feeds.len());
        feeds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use echo_util::KeyPair;

    fn feeds_dir(storage: &MemoryStorage) -> Arc<dyn Directory> {
        storage.root().create_directory("feeds")
    }

    #[test]
    fn test_append_and_get() {
        let storage = MemoryStorage::new();
        let store = FeedStore::new(feeds_dir(&storage));
        let pair = KeyPair::generate();

        let feed = store
            .open_feed(pair.public_key, Some(pair.secret_key))
            .unwrap();
        assert_eq!(feed.append(b"zero").unwrap(), 0);
        assert_eq!(feed.append(b"one").unwrap(), 1);

        assert_eq!(feed.length(), 2);
        let block = feed.get(1).unwrap();
        assert_eq!(block.feed_key, pair.public_key);
        assert_eq!(block.data, b"one");
        assert!(feed.get(2).is_none());
    }

    #[test]
    fn test_read_only_rejects_append() {
        let storage = MemoryStorage::new();
        let store = FeedStore::new(feeds_dir(&storage));
        let key = PublicKey::random();

        let feed = store.open_feed(key, None).unwrap();
        assert!(matches!(feed.append(b"x"), Err(FeedError::ReadOnly(k)) if k == key));
    }

    #[test]
    fn test_one_handle_per_key_and_upgrade() {
        let storage = MemoryStorage::new();
        let store = FeedStore::new(feeds_dir(&storage));
        let pair = KeyPair::generate();

        let read_only = store.open_feed(pair.public_key, None).unwrap();
        let writable = store
            .open_feed(pair.public_key, Some(pair.secret_key))
            .unwrap();

        assert!(Arc::ptr_eq(&read_only, &writable));
        assert!(read_only.is_writable());
        assert_eq!(store.feeds().len(), 1);
    }

    #[test]
    fn test_reopen_replays_blocks() {
        let storage = MemoryStorage::new();
        let pair = KeyPair::generate();
        {
            let store = FeedStore::new(feeds_dir(&storage));
            let feed = store
                .open_feed(pair.public_key, Some(pair.secret_key.clone()))
                .unwrap();
            for i in 0..5u8 {
                feed.append(&[i; 3]).unwrap();
            }
            store.close();
        }

        let store = FeedStore::new(feeds_dir(&storage));
        let feed = store.open_feed(pair.public_key, None).unwrap();
        assert_eq!(feed.length(), 5);
        assert_eq!(feed.get(4).unwrap().data, vec![4; 3]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let storage = MemoryStorage::new();
        let pair = KeyPair::generate();
        let file = feeds_dir(&storage)
            .get_or_create_file(&pair.public_key.to_hex())
            .unwrap();
        {
            let feed = Feed::open(pair.public_key, Some(pair.secret_key.clone()), file.clone())
                .unwrap();
            feed.append(b"kept").unwrap();
        }
        let intact = file.stat().unwrap().size;
        // Half-written frame: header claims 100 bytes, only 2 follow.
        let mut torn = 100u32.to_le_bytes().to_vec();
        torn.extend_from_slice(&[0, 0, 0, 0, 1, 2]);
        file.write(intact, &torn).unwrap();

        let feed = Feed::open(pair.public_key, Some(pair.secret_key), file.clone()).unwrap();
        assert_eq!(feed.length(), 1);
        assert_eq!(file.stat().unwrap().size, intact);

        // Appends continue right after the last good block.
        assert_eq!(feed.append(b"next").unwrap(), 1);
        let reopened = Feed::open(pair.public_key, None, file).unwrap();
        assert_eq!(reopened.get(1).unwrap().data, b"next");
    }

    #[test]
    fn test_closed_feed_rejects_append() {
        let storage = MemoryStorage::new();
        let store = FeedStore::new(feeds_dir(&storage));
        let pair = KeyPair::generate();
        let feed = store
            .open_feed(pair.public_key, Some(pair.secret_key))
            .unwrap();

        store.close();
        assert!(feed.is_closed());
        assert!(matches!(feed.append(b"late"), Err(FeedError::Closed(_))));
        assert!(store.get_feed(&pair.public_key).is_none());
    }

    #[tokio::test]
    async fn test_append_notifies_subscribers() {
        let storage = MemoryStorage::new();
        let store = FeedStore::new(feeds_dir(&storage));
        let pair = KeyPair::generate();
        let feed = store
            .open_feed(pair.public_key, Some(pair.secret_key))
            .unwrap();

        let mut rx = feed.subscribe();
        feed.append(b"wake").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}

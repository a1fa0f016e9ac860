//! Owns the feeds of one party and decides which of them are writable.

use echo_util::{PublicKey, Timeframe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::feed::{Feed, FeedError, FeedStore, FeedStoreIterator, IteratorConfig, MessageSelector};
use crate::keyring::{KeyType, Keyring};
use crate::lock;
use crate::metadata::{MetadataError, MetadataStore};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
}

pub struct PartyFeedProvider {
    party_key: PublicKey,
    metadata: Arc<MetadataStore>,
    keyring: Arc<Keyring>,
    feed_store: Arc<FeedStore>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<Feed>>>>,
}

impl PartyFeedProvider {
    pub fn new(
        party_key: PublicKey,
        metadata: Arc<MetadataStore>,
        keyring: Arc<Keyring>,
        feed_store: Arc<FeedStore>,
    ) -> Self {
        Self {
            party_key,
            metadata,
            keyring,
            feed_store,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn party_key(&self) -> PublicKey {
        self.party_key
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    fn party_feed_keys(&self) -> Vec<PublicKey> {
        self.metadata
            .get_party(&self.party_key)
            .map(|party| party.feed_keys)
            .unwrap_or_default()
    }

    /// Reopen the party's own feed if we hold one of its secret keys,
    /// otherwise create a new feed and admit it to the party.
    pub fn create_or_open_writable_feed(&self) -> Result<Arc<Feed>, ProviderError> {
        let party = self.metadata.get_party(&self.party_key);
        let owned = party.iter().flat_map(|party| party.feed_keys.iter()).find_map(|key| {
            self.keyring
                .get_full_key(key)
                .map(|full| (*key, full.secret_key))
        });
        if let Some((feed_key, secret_key)) = owned {
            let feed = self.feed_store.open_feed(feed_key, Some(secret_key))?;
            self.notify(&feed);
            return Ok(feed);
        }

        let created = self.keyring.create_key_record(KeyType::Feed);
        let feed_key = created.record.public_key;
        self.metadata.add_party_feed(self.party_key, feed_key)?;
        // The first feed of a party we start is its genesis feed.
        if party.map_or(true, |party| party.feed_keys.is_empty()) {
            self.metadata.set_genesis_feed(self.party_key, feed_key)?;
        }

        let feed = self.feed_store.open_feed(feed_key, Some(created.secret_key))?;
        log::info!(
            "Created writable feed {} for party {}",
            feed_key.truncate(),
            self.party_key.truncate()
        );
        self.notify(&feed);
        Ok(feed)
    }

    /// Admit a remote feed and open it for reading.
    pub fn create_or_open_read_only_feed(
        &self,
        feed_key: PublicKey,
    ) -> Result<Arc<Feed>, ProviderError> {
        self.metadata.add_party_feed(self.party_key, feed_key)?;
        if !self.keyring.has_key(&feed_key) {
            self.keyring.add_public_key(feed_key, KeyType::Feed);
        }
        // Our own feed stays writable even when admitted again by a peer.
        let secret_key = self.keyring.get_full_key(&feed_key).map(|full| full.secret_key);
        let feed = self.feed_store.open_feed(feed_key, secret_key)?;
        self.notify(&feed);
        Ok(feed)
    }

    /// Open every feed the metadata lists for this party.
    pub fn open_party_feeds(&self) -> Result<Vec<Arc<Feed>>, ProviderError> {
        self.party_feed_keys()
            .into_iter()
            .map(|key| {
                let secret_key = self.keyring.get_full_key(&key).map(|full| full.secret_key);
                let feed = self.feed_store.open_feed(key, secret_key)?;
                self.notify(&feed);
                Ok(feed)
            })
            .collect()
    }

    /// Currently open feeds of the party.
    pub fn get_feeds(&self) -> Vec<Arc<Feed>> {
        self.party_feed_keys()
            .iter()
            .filter_map(|key| self.feed_store.get_feed(key))
            .collect()
    }

    /// Iterator over every party feed, including feeds opened later.
    pub fn create_iterator(
        &self,
        selector: impl MessageSelector + 'static,
        initial_timeframe: Option<Timeframe>,
        config: IteratorConfig,
    ) -> FeedStoreIterator {
        // Subscribe before listing so no feed opened in between is missed.
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        FeedStoreIterator::new(
            self.get_feeds(),
            rx,
            selector,
            initial_timeframe.unwrap_or_default(),
            config,
        )
    }

    fn notify(&self, feed: &Arc<Feed>) {
        lock(&self.subscribers).retain(|tx| tx.send(feed.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::first_candidate;
    use crate::storage::{Directory, MemoryStorage};

    struct Fixture {
        storage: MemoryStorage,
        keyring: Arc<Keyring>,
        party_key: PublicKey,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                storage: MemoryStorage::new(),
                keyring: Arc::new(Keyring::new()),
                party_key: PublicKey::random(),
            }
        }

        fn provider(&self) -> (PartyFeedProvider, Arc<MetadataStore>) {
            let root = self.storage.root();
            let metadata = Arc::new(MetadataStore::new(root.create_directory("metadata")));
            metadata.load().unwrap();
            let feed_store = Arc::new(FeedStore::new(root.create_directory("feeds")));
            let provider = PartyFeedProvider::new(
                self.party_key,
                metadata.clone(),
                self.keyring.clone(),
                feed_store,
            );
            (provider, metadata)
        }
    }

    #[test]
    fn test_writable_feed_created_once() {
        let fixture = Fixture::new();
        let (provider, metadata) = fixture.provider();

        let feed = provider.create_or_open_writable_feed().unwrap();
        assert!(feed.is_writable());
        let again = provider.create_or_open_writable_feed().unwrap();
        assert!(Arc::ptr_eq(&feed, &again));

        let party = metadata.get_party(&fixture.party_key).unwrap();
        assert_eq!(party.feed_keys, vec![feed.key()]);
        assert_eq!(party.genesis_feed_key, Some(feed.key()));
    }

    #[test]
    fn test_writable_feed_survives_restart() {
        let fixture = Fixture::new();
        let key = {
            let (provider, _) = fixture.provider();
            let feed = provider.create_or_open_writable_feed().unwrap();
            feed.append(b"hello").unwrap();
            feed.key()
        };

        let (provider, metadata) = fixture.provider();
        let feed = provider.create_or_open_writable_feed().unwrap();
        assert_eq!(feed.key(), key);
        assert_eq!(feed.length(), 1);
        assert_eq!(metadata.get_party(&fixture.party_key).unwrap().feed_keys.len(), 1);
    }

    #[test]
    fn test_read_only_feed_registration() {
        let fixture = Fixture::new();
        let (provider, metadata) = fixture.provider();
        let remote = PublicKey::random();

        let feed = provider.create_or_open_read_only_feed(remote).unwrap();
        assert!(!feed.is_writable());
        assert!(fixture.keyring.has_key(&remote));
        assert!(!fixture.keyring.has_secret_key(&remote));
        assert_eq!(
            metadata.get_party(&fixture.party_key).unwrap().feed_keys,
            vec![remote]
        );

        // A read-only feed is not picked as the writable one.
        let writable = provider.create_or_open_writable_feed().unwrap();
        assert_ne!(writable.key(), remote);
        assert_eq!(provider.get_feeds().len(), 2);
        assert_eq!(
            metadata.get_party(&fixture.party_key).unwrap().genesis_feed_key,
            None
        );
    }

    #[tokio::test]
    async fn test_iterator_sees_later_feeds() {
        let fixture = Fixture::new();
        let (provider, _) = fixture.provider();
        let own = provider.create_or_open_writable_feed().unwrap();
        let mut iterator =
            provider.create_iterator(first_candidate(), None, IteratorConfig::for_testing());
        assert_eq!(iterator.feed_count(), 1);

        // Admitted later; writable because the keyring holds its secret.
        let pair = fixture.keyring.create_key_record(KeyType::Feed);
        let late = provider.create_or_open_read_only_feed(pair.record.public_key).unwrap();
        assert!(late.is_writable());
        late.append(b"late").unwrap();

        let block = iterator.next().await.unwrap().unwrap();
        assert_eq!(block.feed_key, late.key());
        assert_eq!(iterator.feed_count(), 2);
        assert_eq!(own.length(), 0);
    }
}

//! Party pipeline: feeds in, replicated state out.
//!
//! ```text
//! write_* ──► writable Feed ─┐
//!                            ├─► FeedStoreIterator (dependency selector)
//! remote Feeds ──────────────┘            │
//!                                         ▼
//!                              processing task ──► PartyState ──► SnapshotStore
//!                                         │
//!                                         └─► watch<Timeframe> (wait_for_timeframe)
//! ```

use echo_util::{PublicKey, Timeframe};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::feed_provider::{PartyFeedProvider, ProviderError};
use super::messages::{dependency_selector, EchoEnvelope, FeedMessage, MessageCodecError, Payload};
use crate::feed::{Feed, FeedBlock, FeedError, FeedStoreIterator, IteratorCloser, IteratorConfig};
use crate::lock;
use crate::model::ModelRegistry;
use crate::snapshot::{ItemError, PartySnapshot, PartyState, SnapshotError, SnapshotStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Codec(#[from] MessageCodecError),
    #[error("Snapshot belongs to party {actual:?}, expected {expected:?}")]
    PartyMismatch { expected: PublicKey, actual: PublicKey },
    #[error("No snapshot store configured")]
    NoSnapshotStore,
    #[error("Pipeline requires a tokio runtime")]
    NoRuntime,
    #[error("Pipeline closed")]
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub iterator: IteratorConfig,
    /// Save a snapshot every n processed messages. Default: never.
    pub snapshot_interval: Option<u64>,
}

impl PipelineConfig {
    pub fn for_testing() -> Self {
        Self {
            iterator: IteratorConfig::for_testing(),
            snapshot_interval: None,
        }
    }
}

pub struct PartyPipeline {
    provider: Arc<PartyFeedProvider>,
    writable_feed: Arc<Feed>,
    state: Arc<Mutex<PartyState>>,
    processed: watch::Receiver<Timeframe>,
    snapshots: Option<Arc<SnapshotStore>>,
    closer: IteratorCloser,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartyPipeline {
    /// Restore `snapshot` if given, open the party feeds and start processing.
    pub fn open(
        provider: Arc<PartyFeedProvider>,
        registry: Arc<ModelRegistry>,
        snapshots: Option<Arc<SnapshotStore>>,
        snapshot: Option<&PartySnapshot>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let party_key = provider.party_key();

        let mut state = PartyState::new(Some(party_key), registry);
        if let Some(snapshot) = snapshot {
            if let Some(actual) = snapshot.party_key.filter(|key| *key != party_key) {
                return Err(PipelineError::PartyMismatch {
                    expected: party_key,
                    actual,
                });
            }
            state.restore_from_snapshot(snapshot)?;
            log::info!(
                "Party {} restored from snapshot at {}",
                party_key.truncate(),
                state.timeframe()
            );
        }

        provider.open_party_feeds()?;
        let writable_feed = provider.create_or_open_writable_feed()?;
        let iterator = provider.create_iterator(
            dependency_selector(),
            Some(state.timeframe().clone()),
            config.iterator,
        );
        let closer = iterator.closer();

        let (processed_tx, processed) = watch::channel(state.timeframe().clone());
        let state = Arc::new(Mutex::new(state));
        let processor = Processor {
            state: state.clone(),
            processed: processed_tx,
            snapshots: snapshots.clone(),
            snapshot_interval: config.snapshot_interval,
            since_snapshot: 0,
        };
        let task = runtime.spawn(processor.run(iterator));
        log::debug!(
            "Pipeline for party {} started, writing to feed {}",
            party_key.truncate(),
            writable_feed.key().truncate()
        );

        Ok(Self {
            provider,
            writable_feed,
            state,
            processed,
            snapshots,
            closer,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn party_key(&self) -> PublicKey {
        self.provider.party_key()
    }

    pub fn provider(&self) -> &Arc<PartyFeedProvider> {
        &self.provider
    }

    pub fn writable_feed_key(&self) -> PublicKey {
        self.writable_feed.key()
    }

    /// Append a credential message. Returns its sequence in the writable feed.
    pub fn write_halo(&self, message: Vec<u8>) -> Result<u64, PipelineError> {
        self.write(Payload::Halo(message))
    }

    /// Append an item message. Returns its sequence in the writable feed.
    pub fn write_echo(&self, envelope: EchoEnvelope) -> Result<u64, PipelineError> {
        self.write(Payload::Echo(envelope))
    }

    fn write(&self, payload: Payload) -> Result<u64, PipelineError> {
        let message = FeedMessage {
            timeframe: self.timeframe(),
            payload,
        };
        Ok(self.writable_feed.append(&message.encode()?)?)
    }

    /// Resolves once every position in `target` has been processed.
    pub async fn wait_for_timeframe(&self, target: &Timeframe) -> Result<(), PipelineError> {
        let mut processed = self.processed.clone();
        processed
            .wait_for(|current| current.dependencies_satisfied(target))
            .await
            .map(|_| ())
            .map_err(|_| PipelineError::Closed)
    }

    /// Processed timeframe.
    pub fn timeframe(&self) -> Timeframe {
        self.processed.borrow().clone()
    }

    pub fn state(&self) -> MutexGuard<'_, PartyState> {
        lock(&self.state)
    }

    pub fn create_snapshot(&self) -> Result<PartySnapshot, PipelineError> {
        Ok(self.state().create_snapshot()?)
    }

    /// Snapshot the current state into the snapshot store.
    pub fn save_snapshot(&self) -> Result<PartySnapshot, PipelineError> {
        let store = self.snapshots.as_ref().ok_or(PipelineError::NoSnapshotStore)?;
        let snapshot = self.create_snapshot()?;
        store.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Stop processing and wait for the task to finish.
    pub async fn close(&self) {
        self.closer.close();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Pipeline task for party {} failed: {e}", self.party_key().truncate());
            }
        }
    }
}

impl Drop for PartyPipeline {
    fn drop(&mut self) {
        self.closer.close();
    }
}

struct Processor {
    state: Arc<Mutex<PartyState>>,
    processed: watch::Sender<Timeframe>,
    snapshots: Option<Arc<SnapshotStore>>,
    snapshot_interval: Option<u64>,
    since_snapshot: u64,
}

impl Processor {
    async fn run(mut self, mut iterator: FeedStoreIterator) {
        loop {
            match iterator.next().await {
                Ok(Some(block)) => self.process(block),
                Ok(None) => break,
                Err(e) => {
                    log::error!("Pipeline iterator failed: {e}");
                    break;
                }
            }
        }
        log::debug!("Pipeline processing stopped at {}", iterator.timeframe());
    }

    fn process(&mut self, block: FeedBlock) {
        let shared = self.state.clone();
        let mut state = lock(&shared);
        match FeedMessage::decode(&block.data) {
            Ok(message) => {
                if let Err(e) = apply(&mut state, message.payload) {
                    log::warn!(
                        "Skipping message {}:{}: {e}",
                        block.feed_key.truncate(),
                        block.seq
                    );
                }
            }
            Err(e) => log::warn!(
                "Dropping undecodable message {}:{}: {e}",
                block.feed_key.truncate(),
                block.seq
            ),
        }
        state.advance(block.feed_key, block.seq);
        self.maybe_snapshot(&state);
        let timeframe = state.timeframe().clone();
        drop(state);
        self.processed.send_replace(timeframe);
    }

    fn maybe_snapshot(&mut self, state: &PartyState) {
        let (Some(store), Some(interval)) = (&self.snapshots, self.snapshot_interval) else {
            return;
        };
        self.since_snapshot += 1;
        if self.since_snapshot < interval {
            return;
        }
        self.since_snapshot = 0;
        let saved = state
            .create_snapshot()
            .and_then(|snapshot| store.save(&snapshot));
        if let Err(e) = saved {
            log::warn!("Periodic snapshot failed: {e}");
        }
    }
}

fn apply(state: &mut PartyState, payload: Payload) -> Result<(), ItemError> {
    match payload {
        Payload::Halo(message) => state.add_halo_message(message),
        Payload::Echo(envelope) => {
            if let Some(genesis) = envelope.genesis {
                state.create_item(
                    envelope.item_id.clone(),
                    genesis.item_type,
                    &genesis.model_type,
                    genesis.parent_id,
                )?;
            }
            if let Some(mutation) = envelope.mutation {
                state.mutate_item(&envelope.item_id, &mutation)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedStore;
    use crate::keyring::Keyring;
    use crate::metadata::MetadataStore;
    use crate::model::object::{ObjectModel, ObjectMutation, OBJECT_MODEL};
    use crate::storage::{Directory, MemoryStorage};
    use serde_json::json;

    fn provider(
        storage: &MemoryStorage,
        keyring: &Arc<Keyring>,
        party_key: PublicKey,
    ) -> Arc<PartyFeedProvider> {
        let metadata = Arc::new(MetadataStore::new(
            storage.root().create_directory("metadata"),
        ));
        metadata.load().unwrap();
        Arc::new(PartyFeedProvider::new(
            party_key,
            metadata,
            keyring.clone(),
            Arc::new(FeedStore::new(storage.root().create_directory("feeds"))),
        ))
    }

    fn open(provider: Arc<PartyFeedProvider>, snapshot: Option<&PartySnapshot>) -> PartyPipeline {
        PartyPipeline::open(
            provider,
            Arc::new(ModelRegistry::with_defaults()),
            None,
            snapshot,
            PipelineConfig::for_testing(),
        )
        .unwrap()
    }

    async fn write_and_wait(pipeline: &PartyPipeline, envelope: EchoEnvelope) {
        let seq = pipeline.write_echo(envelope).unwrap();
        let target = Timeframe::from_entries([(pipeline.writable_feed_key(), seq)]);
        pipeline.wait_for_timeframe(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_process() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let pipeline = open(provider(&storage, &keyring, PublicKey::random()), None);

        write_and_wait(
            &pipeline,
            EchoEnvelope::genesis("task", OBJECT_MODEL, Some("task".into()), None)
                .with_mutation(ObjectMutation::set("title", json!("draft")).encode().unwrap()),
        )
        .await;
        write_and_wait(
            &pipeline,
            EchoEnvelope::mutation(
                "task",
                ObjectMutation::set("title", json!("final")).encode().unwrap(),
            ),
        )
        .await;

        {
            let state = pipeline.state();
            let model = state.item("task").unwrap().model_as::<ObjectModel>().unwrap();
            assert_eq!(model.get("title"), Some(&json!("final")));
        }
        assert_eq!(pipeline.timeframe().get(&pipeline.writable_feed_key()), Some(1));
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_bad_message_skipped_timeframe_advances() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let pipeline = open(provider(&storage, &keyring, PublicKey::random()), None);

        // Mutation of an item that does not exist.
        write_and_wait(&pipeline, EchoEnvelope::mutation("ghost", b"{}".to_vec())).await;
        pipeline.write_halo(b"credential".to_vec()).unwrap();
        let target = Timeframe::from_entries([(pipeline.writable_feed_key(), 1)]);
        pipeline.wait_for_timeframe(&target).await.unwrap();

        let state = pipeline.state();
        assert_eq!(state.item_count(), 0);
        assert_eq!(state.halo_messages(), &[b"credential".to_vec()]);
    }

    #[tokio::test]
    async fn test_restart_from_snapshot_resumes() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let party_key = PublicKey::random();

        let snapshot = {
            let pipeline = open(provider(&storage, &keyring, party_key), None);
            write_and_wait(&pipeline, EchoEnvelope::genesis("a", OBJECT_MODEL, None, None)).await;
            let snapshot = pipeline.create_snapshot().unwrap();
            write_and_wait(&pipeline, EchoEnvelope::genesis("b", OBJECT_MODEL, None, None)).await;
            pipeline.close().await;
            snapshot
        };

        // "a" comes from the snapshot, "b" is replayed from the feed.
        let pipeline = open(provider(&storage, &keyring, party_key), Some(&snapshot));
        let key = pipeline.writable_feed_key();
        pipeline
            .wait_for_timeframe(&Timeframe::from_entries([(key, 1)]))
            .await
            .unwrap();
        let state = pipeline.state();
        assert_eq!(state.item_count(), 2);
        assert!(state.item("a").is_some() && state.item("b").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_of_other_party_rejected() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let foreign = PartySnapshot {
            party_key: Some(PublicKey::random()),
            ..PartySnapshot::default()
        };
        let result = PartyPipeline::open(
            provider(&storage, &keyring, PublicKey::random()),
            Arc::new(ModelRegistry::with_defaults()),
            None,
            Some(&foreign),
            PipelineConfig::for_testing(),
        );
        assert!(matches!(result, Err(PipelineError::PartyMismatch { .. })));
    }

    #[test]
    fn test_requires_runtime() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let result = PartyPipeline::open(
            provider(&storage, &keyring, PublicKey::random()),
            Arc::new(ModelRegistry::with_defaults()),
            None,
            None,
            PipelineConfig::for_testing(),
        );
        assert!(matches!(result, Err(PipelineError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_periodic_snapshots() {
        let storage = MemoryStorage::new();
        let keyring = Arc::new(Keyring::new());
        let party_key = PublicKey::random();
        let store = Arc::new(SnapshotStore::new(storage.root().create_directory("snapshots")));
        let pipeline = PartyPipeline::open(
            provider(&storage, &keyring, party_key),
            Arc::new(ModelRegistry::with_defaults()),
            Some(store.clone()),
            None,
            PipelineConfig {
                snapshot_interval: Some(2),
                ..PipelineConfig::for_testing()
            },
        )
        .unwrap();

        write_and_wait(&pipeline, EchoEnvelope::genesis("a", OBJECT_MODEL, None, None)).await;
        assert!(store.load(&party_key).unwrap().is_none());
        write_and_wait(&pipeline, EchoEnvelope::genesis("b", OBJECT_MODEL, None, None)).await;
        assert_eq!(store.load(&party_key).unwrap().unwrap().item_count(), 2);
    }
}

//! Merged iterator over a dynamic set of feeds.
//!
//! At every step the iterator collects the next unread block of each feed
//! (the heads) and asks a [`MessageSelector`] which one is ready. Per-feed
//! order is always preserved since only heads are offered. Progress is the
//! iterator's [`Timeframe`]; an iterator seeded with a timeframe resumes right
//! after it.
//!
//! When nothing becomes selectable within `stall_timeout`, a [`StallEvent`]
//! is broadcast and iteration keeps waiting. With `max_consecutive_stalls`
//! set, the n-th consecutive stall is returned as [`IteratorError::Stalled`].

use echo_util::{PublicKey, Timeframe};
use futures_util::future::select_all;
use futures_util::Stream;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use super::{Feed, FeedBlock};

/// Picks which head to emit next. `None` means no head is ready yet.
pub trait MessageSelector: Send + Sync {
    fn select(&self, candidates: &[FeedBlock], current: &Timeframe) -> Option<usize>;
}

impl<F> MessageSelector for F
where
    F: Fn(&[FeedBlock], &Timeframe) -> Option<usize> + Send + Sync,
{
    fn select(&self, candidates: &[FeedBlock], current: &Timeframe) -> Option<usize> {
        self(candidates, current)
    }
}

/// Always take the first available head.
pub fn first_candidate() -> impl MessageSelector {
    |candidates: &[FeedBlock], _: &Timeframe| (!candidates.is_empty()).then_some(0)
}

#[derive(Debug, Clone)]
pub struct IteratorConfig {
    /// Wait before reporting a stall. Default: 1s.
    pub stall_timeout: Duration,
    /// Escalate after this many consecutive stalls. Default: never.
    pub max_consecutive_stalls: Option<u32>,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(1000),
            max_consecutive_stalls: None,
        }
    }
}

impl IteratorConfig {
    pub fn for_testing() -> Self {
        Self {
            stall_timeout: Duration::from_millis(100),
            max_consecutive_stalls: None,
        }
    }
}

/// Diagnostic emitted when no head became selectable in time.
#[derive(Debug, Clone)]
pub struct StallEvent {
    pub timeframe: Timeframe,
    /// Heads that were on offer (possibly none).
    pub candidates: Vec<FeedBlock>,
    pub consecutive: u32,
}

#[derive(Debug, Error)]
pub enum IteratorError {
    #[error("Iterator stalled {consecutive} times in a row at {timeframe}")]
    Stalled { consecutive: u32, timeframe: Timeframe },
}

struct FeedCursor {
    feed: Arc<Feed>,
    changes: watch::Receiver<u64>,
}

/// Handle that closes an iterator from another task.
#[derive(Clone)]
pub struct IteratorCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl IteratorCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

pub struct FeedStoreIterator {
    cursors: Vec<FeedCursor>,
    keys: BTreeSet<PublicKey>,
    new_feeds: Option<mpsc::UnboundedReceiver<Arc<Feed>>>,
    selector: Box<dyn MessageSelector>,
    timeframe: Timeframe,
    config: IteratorConfig,
    stalls: broadcast::Sender<StallEvent>,
    consecutive_stalls: u32,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl FeedStoreIterator {
    pub fn new(
        feeds: Vec<Arc<Feed>>,
        new_feeds: mpsc::UnboundedReceiver<Arc<Feed>>,
        selector: impl MessageSelector + 'static,
        initial_timeframe: Timeframe,
        config: IteratorConfig,
    ) -> Self {
        let (stalls, _) = broadcast::channel(16);
        let (close_tx, close_rx) = watch::channel(false);
        let mut iterator = Self {
            cursors: Vec::new(),
            keys: BTreeSet::new(),
            new_feeds: Some(new_feeds),
            selector: Box::new(selector),
            timeframe: initial_timeframe,
            config,
            stalls,
            consecutive_stalls: 0,
            close_tx: Arc::new(close_tx),
            close_rx,
        };
        for feed in feeds {
            iterator.add_feed(feed);
        }
        iterator
    }

    /// Start reading `feed`. Duplicates are ignored.
    pub fn add_feed(&mut self, feed: Arc<Feed>) {
        if !self.keys.insert(feed.key()) {
            return;
        }
        log::debug!(
            "Iterator reading feed {} from seq {}",
            feed.key().truncate(),
            self.timeframe.next_seq(&feed.key())
        );
        let changes = feed.subscribe();
        self.cursors.push(FeedCursor { feed, changes });
    }

    /// Processed position of every feed.
    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    pub fn feed_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn subscribe_stalls(&self) -> broadcast::Receiver<StallEvent> {
        self.stalls.subscribe()
    }

    pub fn closer(&self) -> IteratorCloser {
        IteratorCloser {
            tx: self.close_tx.clone(),
        }
    }

    /// Stop iteration; pending and later `next` calls return `Ok(None)`.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.close_rx.borrow()
    }

    fn drain_new_feeds(&mut self) {
        let mut added = Vec::new();
        let mut disconnected = false;
        if let Some(rx) = self.new_feeds.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(feed) => added.push(feed),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }
        if disconnected {
            self.new_feeds = None;
        }
        for feed in added {
            self.add_feed(feed);
        }
    }

    fn candidates(&mut self) -> Vec<FeedBlock> {
        let timeframe = &self.timeframe;
        self.cursors
            .iter_mut()
            .filter_map(|cursor| {
                // Mark current length seen before reading so a later append wakes us.
                cursor.changes.mark_unchanged();
                cursor.feed.get(timeframe.next_seq(&cursor.feed.key()))
            })
            .collect()
    }

    /// Next ready block, `Ok(None)` once closed.
    pub async fn next(&mut self) -> Result<Option<FeedBlock>, IteratorError> {
        let mut deadline = Instant::now() + self.config.stall_timeout;
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            self.drain_new_feeds();

            let candidates = self.candidates();
            let selected = self
                .selector
                .select(&candidates, &self.timeframe)
                .and_then(|index| candidates.get(index))
                .cloned();
            if let Some(block) = selected {
                self.timeframe.set(block.feed_key, block.seq);
                self.consecutive_stalls = 0;
                return Ok(Some(block));
            }

            if self.wait_for_change(deadline).await {
                continue;
            }

            self.consecutive_stalls += 1;
            let event = StallEvent {
                timeframe: self.timeframe.clone(),
                candidates,
                consecutive: self.consecutive_stalls,
            };
            log::warn!(
                "Feed iterator stalled (#{}) at {} with {} candidate(s) across {} feed(s)",
                event.consecutive,
                event.timeframe,
                event.candidates.len(),
                self.cursors.len()
            );
            let _ = self.stalls.send(event);

            if let Some(max) = self.config.max_consecutive_stalls {
                if self.consecutive_stalls >= max {
                    return Err(IteratorError::Stalled {
                        consecutive: self.consecutive_stalls,
                        timeframe: self.timeframe.clone(),
                    });
                }
            }
            deadline = Instant::now() + self.config.stall_timeout;
        }
    }

    /// Wait for an append, a new feed or close. `false` on timeout.
    async fn wait_for_change(&mut self, deadline: Instant) -> bool {
        let Self {
            cursors,
            new_feeds,
            close_rx,
            ..
        } = self;

        let appended = async {
            if cursors.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let changes = cursors
                    .iter_mut()
                    .map(|cursor| Box::pin(cursor.changes.changed()));
                let _ = select_all(changes).await;
            }
        };

        let new_feed = async {
            let received = match new_feeds.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            };
            if received.is_none() {
                // Provider gone: no more feeds will arrive.
                *new_feeds = None;
            }
            received
        };

        let result = tokio::time::timeout_at(deadline, async {
            tokio::select! {
                _ = appended => None,
                feed = new_feed => feed,
                _ = close_rx.changed() => None,
            }
        })
        .await;

        match result {
            Ok(Some(feed)) => {
                self.add_feed(feed);
                true
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Adapt into a `Stream`. Ends when the iterator is closed.
    pub fn into_stream(self) -> impl Stream<Item = Result<FeedBlock, IteratorError>> {
        futures_util::stream::unfold(self, |mut iterator| async move {
            match iterator.next().await {
                Ok(Some(block)) => Some((Ok(block), iterator)),
                Ok(None) => None,
                Err(err) => Some((Err(err), iterator)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedStore;
    use crate::storage::MemoryStorage;
    use echo_util::KeyPair;
    use futures_util::StreamExt;

    fn writable_feed(store: &FeedStore) -> Arc<Feed> {
        let pair = KeyPair::generate();
        store
            .open_feed(pair.public_key, Some(pair.secret_key))
            .unwrap()
    }

    fn iterator(feeds: Vec<Arc<Feed>>, timeframe: Timeframe) -> FeedStoreIterator {
        let (_tx, rx) = mpsc::unbounded_channel();
        FeedStoreIterator::new(
            feeds,
            rx,
            first_candidate(),
            timeframe,
            IteratorConfig::for_testing(),
        )
    }

    #[tokio::test]
    async fn test_preserves_per_feed_order() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let a = writable_feed(&store);
        let b = writable_feed(&store);
        for i in 0..3u8 {
            a.append(&[b'a', i]).unwrap();
            b.append(&[b'b', i]).unwrap();
        }

        let mut it = iterator(vec![a.clone(), b.clone()], Timeframe::new());
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(it.next().await.unwrap().unwrap());
        }

        for feed in [&a, &b] {
            let seqs: Vec<u64> = seen
                .iter()
                .filter(|block| block.feed_key == feed.key())
                .map(|block| block.seq)
                .collect();
            assert_eq!(seqs, vec![0, 1, 2]);
        }
        assert_eq!(it.timeframe().get(&a.key()), Some(2));
        assert_eq!(it.timeframe().get(&b.key()), Some(2));
    }

    #[tokio::test]
    async fn test_timeframe_is_resumable() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let a = writable_feed(&store);
        let b = writable_feed(&store);
        for i in 0..4u8 {
            a.append(&[i]).unwrap();
            b.append(&[i]).unwrap();
        }

        let mut first = iterator(vec![a.clone(), b.clone()], Timeframe::new());
        let mut consumed = Vec::new();
        for _ in 0..5 {
            consumed.push(first.next().await.unwrap().unwrap());
        }
        let checkpoint = first.timeframe().clone();
        assert_eq!(checkpoint.total_messages(), 5);

        let mut resumed = iterator(vec![a.clone(), b.clone()], checkpoint);
        let mut rest = Vec::new();
        for _ in 0..3 {
            rest.push(resumed.next().await.unwrap().unwrap());
        }

        let mut all: Vec<(PublicKey, u64)> = consumed
            .iter()
            .chain(rest.iter())
            .map(|block| (block.feed_key, block.seq))
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8, "no duplicates and nothing skipped");
    }

    #[tokio::test]
    async fn test_waits_for_append() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let feed = writable_feed(&store);
        let mut it = iterator(vec![feed.clone()], Timeframe::new());

        let writer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(b"late").unwrap();
        });

        let block = it.next().await.unwrap().unwrap();
        assert_eq!(block.data, b"late");
    }

    #[tokio::test]
    async fn test_new_feeds_join_iteration() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut it = FeedStoreIterator::new(
            Vec::new(),
            rx,
            first_candidate(),
            Timeframe::new(),
            IteratorConfig::for_testing(),
        );

        let feed = writable_feed(&store);
        feed.append(b"hello").unwrap();
        tx.send(feed.clone()).unwrap();
        tx.send(feed.clone()).unwrap();

        let block = it.next().await.unwrap().unwrap();
        assert_eq!(block.data, b"hello");
        assert_eq!(it.feed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_is_reported_not_fatal() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let feed = writable_feed(&store);
        feed.append(b"blocked").unwrap();

        let (_tx, rx) = mpsc::unbounded_channel();
        let never = |_: &[FeedBlock], _: &Timeframe| -> Option<usize> { None };
        let mut it = FeedStoreIterator::new(
            vec![feed.clone()],
            rx,
            never,
            Timeframe::new(),
            IteratorConfig::default(),
        );
        let mut stalls = it.subscribe_stalls();
        let closer = it.closer();

        let handle = tokio::spawn(async move { it.next().await });

        let first = stalls.recv().await.unwrap();
        assert_eq!(first.consecutive, 1);
        assert_eq!(first.candidates.len(), 1);
        let second = stalls.recv().await.unwrap();
        assert_eq!(second.consecutive, 2);

        closer.close();
        assert!(handle.await.unwrap().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_escalation_policy() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut it = FeedStoreIterator::new(
            Vec::new(),
            rx,
            first_candidate(),
            Timeframe::new(),
            IteratorConfig {
                stall_timeout: Duration::from_millis(50),
                max_consecutive_stalls: Some(3),
            },
        );

        let err = it.next().await.unwrap_err();
        assert!(matches!(err, IteratorError::Stalled { consecutive: 3, .. }));
    }

    #[tokio::test]
    async fn test_custom_selector_orders_across_feeds() {
        let store = FeedStore::new(MemoryStorage::new().root());
        let a = writable_feed(&store);
        let b = writable_feed(&store);
        a.append(&[3]).unwrap();
        b.append(&[1]).unwrap();
        b.append(&[2]).unwrap();

        // Smallest payload first.
        let smallest = |candidates: &[FeedBlock], _: &Timeframe| {
            candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, block)| block.data[0])
                .map(|(index, _)| index)
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let it = FeedStoreIterator::new(
            vec![a, b],
            rx,
            smallest,
            Timeframe::new(),
            IteratorConfig::for_testing(),
        );

        let closer = it.closer();
        let data: Vec<u8> = it
            .into_stream()
            .take(3)
            .map(|block| block.unwrap().data[0])
            .collect()
            .await;
        closer.close();
        assert_eq!(data, vec![1, 2, 3]);
    }
}

//! Timeframe: vector clock of per-feed processing progress.
//!
//! Each entry maps a feed key to the highest sequence number processed from
//! that feed. Absent feeds have processed nothing. Entries only move forward.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::keys::PublicKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<PublicKey, u64>,
}

impl Timeframe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (PublicKey, u64)>) -> Self {
        let mut tf = Self::new();
        for (key, seq) in entries {
            tf.set(key, seq);
        }
        tf
    }

    /// Highest processed sequence for `key`.
    pub fn get(&self, key: &PublicKey) -> Option<u64> {
        self.frames.get(key).copied()
    }

    /// Record `seq` as processed. Never moves an entry backwards.
    ///
    /// Returns `true` if the entry advanced.
    pub fn set(&mut self, key: PublicKey, seq: u64) -> bool {
        match self.frames.get_mut(&key) {
            Some(current) if *current >= seq => false,
            Some(current) => {
                *current = seq;
                true
            }
            None => {
                self.frames.insert(key, seq);
                true
            }
        }
    }

    /// Next sequence number to read from `key`.
    pub fn next_seq(&self, key: &PublicKey) -> u64 {
        self.get(key).map_or(0, |seq| seq + 1)
    }

    /// Per-feed maximum of both timeframes.
    pub fn merge(&mut self, other: &Timeframe) {
        for (key, seq) in &other.frames {
            self.set(*key, *seq);
        }
    }

    /// Whether every position in `required` has been processed here.
    pub fn dependencies_satisfied(&self, required: &Timeframe) -> bool {
        required
            .frames
            .iter()
            .all(|(key, seq)| self.get(key).is_some_and(|have| have >= *seq))
    }

    /// Number of messages covered by this timeframe.
    pub fn total_messages(&self) -> u64 {
        self.frames.values().map(|seq| seq + 1).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.frames.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, u64)> {
        self.frames.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (key, seq)) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}[{}]", key.truncate(), seq)?;
        }
        f.write_str(")")
    }
}

//! Feed-key compression via admission chains.
//!
//! Every feed in a party was admitted by exactly one other feed, except the
//! genesis feed. The path from genesis to a feed is a list of ordinals (the
//! position of each child in its admitter's admission list), which is much
//! shorter than a 32-byte key.
//!
//! Encoding:
//! ```text
//! chain   [2, 0, 9]          ordinals, genesis first
//!   +1 →  [3, 1, 10]         zero is reserved for padding
//! varint  [0011] [0001] [1010 0001]
//!          │              │
//!          │              └ continuation bit set, low 3 bits = 010; then 001
//!          └ no continuation, value 3
//! packed  0011_0001 1010_0001
//! ```
//!
//! Each nibble holds 3 value bits (least significant chunk first) and a
//! continuation flag in its top bit. Two nibbles per byte, first nibble high.
//! An odd nibble count is padded with a zero low nibble.
//!
//! The byte string has no header and only decodes against the admissions
//! table it was encoded with.

use thiserror::Error;

const CONTINUATION: u8 = 0b1000;
const CHUNK_MASK: u8 = 0b0111;
const CHUNK_BITS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressionError {
    #[error("Feed {0} is not in the admissions table")]
    UnknownFeed(usize),
    #[error("Feed {feed} is not reachable from genesis feed {root}")]
    NotAdmitted { feed: usize, root: usize },
    #[error("Admission cycle detected at feed {0}")]
    Cycle(usize),
    #[error("Truncated varint in compressed key")]
    Truncated,
    #[error("Varint overflow in compressed key")]
    Overflow,
    #[error("Ordinal {ordinal} out of range for feed {feed}")]
    InvalidOrdinal { feed: usize, ordinal: usize },
}

/// Admission graph of one party.
///
/// `admissions[x]` lists, in admission order, the feeds admitted by feed `x`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedAdmissions {
    root: usize,
    admissions: Vec<Vec<usize>>,
}

impl FeedAdmissions {
    pub fn new(root: usize, admissions: Vec<Vec<usize>>) -> Self {
        Self { root, admissions }
    }

    /// Single genesis feed, nothing admitted yet.
    pub fn with_genesis() -> Self {
        Self::new(0, vec![Vec::new()])
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn feed_count(&self) -> usize {
        self.admissions.len()
    }

    pub fn admissions(&self) -> &[Vec<usize>] {
        &self.admissions
    }

    /// Record that `admitter` admitted a new feed. Returns the new feed index.
    pub fn admit(&mut self, admitter: usize) -> Result<usize, CompressionError> {
        if admitter >= self.admissions.len() {
            return Err(CompressionError::UnknownFeed(admitter));
        }
        let feed = self.admissions.len();
        self.admissions.push(Vec::new());
        self.admissions[admitter].push(feed);
        Ok(feed)
    }

    /// Ordinals from genesis down to `feed`.
    pub fn admission_chain(&self, feed: usize) -> Result<Vec<usize>, CompressionError> {
        if feed >= self.admissions.len() {
            return Err(CompressionError::UnknownFeed(feed));
        }

        let mut chain = Vec::new();
        let mut current = feed;
        loop {
            let admitter = self
                .admissions
                .iter()
                .enumerate()
                .find_map(|(x, admitted)| {
                    admitted
                        .iter()
                        .position(|&f| f == current)
                        .map(|ordinal| (x, ordinal))
                });

            match admitter {
                Some((x, ordinal)) => {
                    chain.push(ordinal);
                    current = x;
                    if chain.len() > self.admissions.len() {
                        return Err(CompressionError::Cycle(current));
                    }
                }
                None => break,
            }
        }

        if current != self.root {
            return Err(CompressionError::NotAdmitted {
                feed,
                root: self.root,
            });
        }

        chain.reverse();
        Ok(chain)
    }

    /// Compress `feed` into its admission-chain byte string.
    pub fn encode(&self, feed: usize) -> Result<Vec<u8>, CompressionError> {
        let chain = self.admission_chain(feed)?;
        Ok(encode_chain(&chain))
    }

    /// Resolve a compressed byte string back to a feed index.
    pub fn decode(&self, bytes: &[u8]) -> Result<usize, CompressionError> {
        let chain = decode_chain(bytes)?;
        let mut current = self.root;
        for ordinal in chain {
            current = *self
                .admissions
                .get(current)
                .and_then(|admitted| admitted.get(ordinal))
                .ok_or(CompressionError::InvalidOrdinal {
                    feed: current,
                    ordinal,
                })?;
        }
        Ok(current)
    }
}

/// Pack an ordinal chain into nibble varints.
pub fn encode_chain(chain: &[usize]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(chain.len() * 2);
    for &ordinal in chain {
        let mut value = ordinal as u64 + 1;
        loop {
            let chunk = (value & CHUNK_MASK as u64) as u8;
            value >>= CHUNK_BITS;
            if value == 0 {
                nibbles.push(chunk);
                break;
            }
            nibbles.push(CONTINUATION | chunk);
        }
    }

    nibbles
        .chunks(2)
        .map(|pair| {
            let high = pair[0] << 4;
            let low = pair.get(1).copied().unwrap_or(0);
            high | low
        })
        .collect()
}

/// Unpack nibble varints into an ordinal chain.
pub fn decode_chain(bytes: &[u8]) -> Result<Vec<usize>, CompressionError> {
    let nibbles: Vec<u8> = bytes.iter().flat_map(|b| [b >> 4, b & 0x0F]).collect();

    let mut chain = Vec::new();
    let mut i = 0;
    while i < nibbles.len() {
        // A zero nibble can only start a varint as trailing padding.
        if nibbles[i] == 0 {
            if i == nibbles.len() - 1 {
                break;
            }
            return Err(CompressionError::Truncated);
        }

        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let nibble = *nibbles.get(i).ok_or(CompressionError::Truncated)?;
            i += 1;
            let chunk = (nibble & CHUNK_MASK) as u64;
            // Every bit of the chunk must land inside the value.
            let bits = chunk
                .checked_shl(shift)
                .filter(|bits| bits >> shift == chunk)
                .ok_or(CompressionError::Overflow)?;
            value |= bits;
            shift += CHUNK_BITS;
            if nibble & CONTINUATION == 0 {
                break;
            }
        }
        let ordinal = value.checked_sub(1).ok_or(CompressionError::Truncated)?;
        chain.push(usize::try_from(ordinal).map_err(|_| CompressionError::Overflow)?);
    }

    Ok(chain)
}

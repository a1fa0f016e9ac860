//! # echo-util: leaf codecs for the ECHO replication layer
//!
//! Pure, I/O-free building blocks shared by the feed, invitation and
//! replication code in `echo-pipeline`.
//!
//! ## Modules
//!
//! - [`bitfield`]: MSB-first bit-vector codec over byte buffers (have/want sets)
//! - [`feed_key`]: admission-chain compression of feed identities
//! - [`keys`]: public/secret key types
//! - [`timeframe`]: per-feed vector clock of processed positions
//!
//! ## Wire compatibility
//!
//! | Codec | Layout | Notes |
//! |-------|--------|-------|
//! | BitField | bit `i` at byte `i >> 3`, mask `0x80 >> (i & 7)` | must match peers bit-for-bit |
//! | Feed key chain | packed 4-bit varint nibbles, high nibble first | not self-describing |

pub mod bitfield;
pub mod feed_key;
pub mod keys;
pub mod timeframe;

pub use bitfield::BitFieldError;
pub use feed_key::{CompressionError, FeedAdmissions};
pub use keys::{KeyError, KeyPair, PublicKey, SecretKey};
pub use timeframe::Timeframe;

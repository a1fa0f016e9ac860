//! Bit-vector codec over plain byte buffers.
//!
//! Used by replication to exchange have/want sets of feed blocks.
//!
//! Layout (big-endian within each byte):
//! ```text
//!  byte 0                    byte 1
//! ┌──┬──┬──┬──┬──┬──┬──┬──┐┌──┬──┬──┬──┬──┬──┬──┬──┐
//! │ 0│ 1│ 2│ 3│ 4│ 5│ 6│ 7││ 8│ 9│10│11│12│13│14│15│ ...
//! └──┴──┴──┴──┴──┴──┴──┴──┘└──┴──┴──┴──┴──┴──┴──┴──┘
//!  MSB                  LSB
//! ```
//!
//! The ordering is part of the wire format and must not change.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitFieldError {
    #[error("Bitfield length mismatch: {left} != {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Options for [`find_indexes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindIndexes {
    /// First bit index to inspect.
    pub start: usize,
    /// End of the scan (exclusive). `None` scans to the end of the buffer.
    pub end: Option<usize>,
    /// Bit value to match.
    pub value: bool,
}

impl Default for FindIndexes {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            value: true,
        }
    }
}

#[inline]
fn mask(index: usize) -> u8 {
    0x80 >> (index & 7)
}

/// Read bit `index`. Bits beyond the buffer read as unset.
pub fn get(buf: &[u8], index: usize) -> bool {
    buf.get(index >> 3)
        .map(|byte| byte & mask(index) != 0)
        .unwrap_or(false)
}

/// Set or clear bit `index` in place.
///
/// # Panics
///
/// Panics if `index` lies beyond the buffer.
pub fn set(buf: &mut [u8], index: usize, value: bool) {
    let byte = &mut buf[index >> 3];
    if value {
        *byte |= mask(index);
    } else {
        *byte &= !mask(index);
    }
}

/// Count set bits in `[begin, end)`.
pub fn count(buf: &[u8], begin: usize, end: usize) -> usize {
    let end = end.min(buf.len() * 8);
    if begin >= end {
        return 0;
    }

    let mut total = 0;
    let mut i = begin;

    // Leading partial byte.
    while i < end && i & 7 != 0 {
        total += get(buf, i) as usize;
        i += 1;
    }

    // Whole bytes.
    while i + 8 <= end {
        total += buf[i >> 3].count_ones() as usize;
        i += 8;
    }

    // Trailing partial byte.
    while i < end {
        total += get(buf, i) as usize;
        i += 1;
    }

    total
}

/// Bitwise NOT into a new buffer of the same length.
pub fn invert(buf: &[u8]) -> Vec<u8> {
    buf.iter().map(|b| !b).collect()
}

/// Bitwise AND of two equally sized buffers.
pub fn and(a: &[u8], b: &[u8]) -> Result<Vec<u8>, BitFieldError> {
    if a.len() != b.len() {
        return Err(BitFieldError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.iter().zip(b).map(|(x, y)| x & y).collect())
}

/// All indices in the requested range whose bit equals `options.value`.
pub fn find_indexes(buf: &[u8], options: FindIndexes) -> Vec<usize> {
    let end = options.end.unwrap_or(buf.len() * 8).min(buf.len() * 8);
    (options.start..end)
        .filter(|&i| get(buf, i) == options.value)
        .collect()
}

/// Buffer of `ceil(count / 8)` bytes with exactly the first `count` bits set.
pub fn ones(count: usize) -> Vec<u8> {
    let mut buf = vec![0xFF; count.div_ceil(8)];
    let rem = count & 7;
    if rem != 0 {
        if let Some(last) = buf.last_mut() {
            *last = 0xFF << (8 - rem);
        }
    }
    buf
}

/// Buffer of `ceil(count / 8)` zero bytes.
pub fn zeros(count: usize) -> Vec<u8> {
    vec![0; count.div_ceil(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut buf = vec![0u8; 4];
        set(&mut buf, 16, true);
        assert!(get(&buf, 16));
        assert_eq!(buf, vec![0, 0, 0x80, 0]);
    }

    #[test]
    fn test_msb_first_ordering() {
        let mut buf = vec![0u8; 1];
        set(&mut buf, 0, true);
        assert_eq!(buf[0], 0b1000_0000);
        set(&mut buf, 7, true);
        assert_eq!(buf[0], 0b1000_0001);
    }

    #[test]
    fn test_set_does_not_disturb_neighbours() {
        for index in 0..24 {
            let mut buf = vec![0xFF; 3];
            set(&mut buf, index, false);
            assert!(!get(&buf, index));
            assert_eq!(count(&buf, 0, 24), 23);

            set(&mut buf, index, true);
            assert!(get(&buf, index));
            assert_eq!(buf, vec![0xFF; 3]);
        }
    }

    #[test]
    fn test_count_range() {
        let mut buf = vec![0u8; 4];
        set(&mut buf, 11, true);
        set(&mut buf, 16, true);
        assert_eq!(count(&buf, 10, 20), 2);
        assert_eq!(count(&buf, 12, 16), 0);
        assert_eq!(count(&buf, 0, 32), 2);
        assert_eq!(count(&buf, 20, 10), 0);
    }

    #[test]
    fn test_count_clamps_to_buffer() {
        let buf = vec![0xFF; 2];
        assert_eq!(count(&buf, 3, 1000), 13);
    }

    #[test]
    fn test_get_out_of_range_is_unset() {
        let buf = vec![0xFF; 1];
        assert!(!get(&buf, 8));
    }

    #[test]
    fn test_invert() {
        assert_eq!(invert(&[0b1010_0000, 0xFF]), vec![0b0101_1111, 0x00]);
    }

    #[test]
    fn test_and() {
        let result = and(&[0b1100_0000, 0xF0], &[0b1010_0000, 0x3C]).unwrap();
        assert_eq!(result, vec![0b1000_0000, 0x30]);
    }

    #[test]
    fn test_and_length_mismatch() {
        let err = and(&[0, 0], &[0]).unwrap_err();
        assert_eq!(err, BitFieldError::LengthMismatch { left: 2, right: 1 });
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_find_indexes() {
        let buf = vec![0b0100_0001, 0b1000_0000];
        assert_eq!(find_indexes(&buf, FindIndexes::default()), vec![1, 7, 8]);
        assert_eq!(
            find_indexes(
                &buf,
                FindIndexes {
                    start: 2,
                    end: Some(9),
                    value: true
                }
            ),
            vec![7, 8]
        );
        assert_eq!(
            find_indexes(
                &buf,
                FindIndexes {
                    start: 0,
                    end: Some(4),
                    value: false
                }
            ),
            vec![0, 2, 3]
        );
    }

    #[test]
    fn test_ones_masks_trailing_byte() {
        assert_eq!(ones(5), vec![0b1111_1000]);
        assert_eq!(ones(8), vec![0xFF]);
        assert_eq!(ones(10), vec![0xFF, 0b1100_0000]);
        assert!(ones(0).is_empty());

        for n in 0..40 {
            let buf = ones(n);
            assert_eq!(buf.len(), n.div_ceil(8));
            assert_eq!(count(&buf, 0, buf.len() * 8), n);
        }
    }

    #[test]
    fn test_zeros() {
        assert_eq!(zeros(9), vec![0, 0]);
        assert!(zeros(0).is_empty());
    }
}

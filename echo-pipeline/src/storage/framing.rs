//! Length + checksum framing shared by feeds, metadata and snapshots.
//!
//! Frame layout: `[u32 LE payload length][u32 LE checksum][payload]`.

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// FNV-1a over the payload.
pub fn checksum(payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in payload {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Wrap `payload` in a frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A verified frame and the offset right after it.
    Complete { payload: &'a [u8], next: usize },
    /// Fewer bytes than the header or the declared length.
    Truncated,
    /// Checksum mismatch.
    Corrupt,
}

/// Parse the frame starting at `offset`.
pub fn decode(buf: &[u8], offset: usize) -> Frame<'_> {
    let Some(header) = buf.get(offset..offset + HEADER_LEN) else {
        return Frame::Truncated;
    };
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let start = offset + HEADER_LEN;
    let Some(payload) = start.checked_add(len).and_then(|end| buf.get(start..end)) else {
        return Frame::Truncated;
    };
    if checksum(payload) != expected {
        return Frame::Corrupt;
    }
    Frame::Complete {
        payload,
        next: start + len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sequence() {
        let mut buf = encode(b"first");
        buf.extend(encode(b""));
        buf.extend(encode(b"third"));

        let Frame::Complete { payload, next } = decode(&buf, 0) else {
            panic!("expected frame");
        };
        assert_eq!(payload, b"first");
        let Frame::Complete { payload, next } = decode(&buf, next) else {
            panic!("expected empty frame");
        };
        assert!(payload.is_empty());
        let Frame::Complete { payload, next } = decode(&buf, next) else {
            panic!("expected frame");
        };
        assert_eq!(payload, b"third");
        assert_eq!(decode(&buf, next), Frame::Truncated);
    }

    #[test]
    fn test_torn_and_corrupt() {
        let frame = encode(b"payload");
        assert_eq!(decode(&frame[..3], 0), Frame::Truncated);
        assert_eq!(decode(&frame[..frame.len() - 1], 0), Frame::Truncated);

        let mut flipped = frame.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xFF;
        assert_eq!(decode(&flipped, 0), Frame::Corrupt);
    }

    #[test]
    fn test_checksum_sensitivity() {
        assert_ne!(checksum(b"ab"), checksum(b"ba"));
        assert_eq!(checksum(b""), 0x811c_9dc5);
    }
}

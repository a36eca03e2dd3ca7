//! Single-buffer packing for the connection flavor.
//!
//! Connection-oriented transports carry one message body per peer message,
//! so a multipart frame group is packed into a single buffer:
//!
//! ```text
//! short frame:  [len: u8 < 0xFF] [bytes ...]
//! long frame:   [0xFF] [len: u32 big-endian] [bytes ...]
//! ```
//!
//! An empty group packs to an empty buffer.

use bytes::{BufMut, Bytes, BytesMut};

/// Escape marker introducing a 4-byte length.
const LONG_FRAME: u8 = 0xFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packed frame group truncated at byte {0}")]
    Truncated(usize),
}

/// Pack a frame group into one buffer.
pub fn encode(frames: &[Bytes]) -> Bytes {
    let total: usize = frames.iter().map(|f| 5 + f.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for frame in frames {
        if frame.len() < LONG_FRAME as usize {
            buf.put_u8(frame.len() as u8);
        } else {
            buf.put_u8(LONG_FRAME);
            buf.put_u32(frame.len() as u32);
        }
        buf.put_slice(frame);
    }
    buf.freeze()
}

/// Unpack a buffer produced by [`encode`].
pub fn decode(mut buf: &[u8]) -> Result<Vec<Bytes>, WireError> {
    let full = buf.len();
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let at = full - buf.len();
        let len = match buf[0] {
            LONG_FRAME => {
                if buf.len() < 5 {
                    return Err(WireError::Truncated(at));
                }
                let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
                buf = &buf[5..];
                len
            }
            short => {
                buf = &buf[1..];
                short as usize
            }
        };
        if buf.len() < len {
            return Err(WireError::Truncated(at));
        }
        frames.push(Bytes::copy_from_slice(&buf[..len]));
        buf = &buf[len..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(frames: Vec<Bytes>) {
        let packed = encode(&frames);
        assert_eq!(decode(&packed).unwrap(), frames);
    }

    #[test]
    fn empty_group() {
        assert_eq!(encode(&[]).len(), 0);
        assert_eq!(decode(&[]).unwrap(), Vec::<Bytes>::new());
    }

    #[test]
    fn short_frames() {
        roundtrip(vec![
            Bytes::from_static(b"MDPC01"),
            Bytes::from_static(b"echo"),
            Bytes::new(),
            Bytes::from_static(b"hello"),
        ]);
    }

    #[test]
    fn long_frame_uses_escape() {
        let big = Bytes::from(vec![0xAB; 300]);
        let packed = encode(&[big.clone()]);
        assert_eq!(packed[0], 0xFF);
        assert_eq!(&packed[1..5], &300u32.to_be_bytes());
        roundtrip(vec![big]);
    }

    #[test]
    fn boundary_at_escape_marker() {
        // 254 bytes is the longest short frame; 255 must escape.
        roundtrip(vec![Bytes::from(vec![1u8; 254])]);
        let packed = encode(&[Bytes::from(vec![1u8; 255])]);
        assert_eq!(packed[0], 0xFF);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = decode(&[0xFF, 0x00, 0x00]).unwrap_err();
        assert_eq!(err, WireError::Truncated(0));
    }

    #[test]
    fn truncated_body_is_rejected() {
        // claims 5 bytes, provides 3
        let err = decode(&[0x05, b'a', b'b', b'c']).unwrap_err();
        assert_eq!(err, WireError::Truncated(0));
    }
}

//! Opaque peer identities.
//!
//! Both transport flavors collapse to the same identity type: an immutable
//! byte-string. The envelope flavor hands us the routing frame verbatim;
//! the connection flavor assigns a `u32` per peer, stored here as its four
//! big-endian bytes so the reverse mapping is exact.

use std::fmt;

use bytes::Bytes;

/// Identity of a remote transport peer. Byte-wise equality and hashing;
/// not required to be printable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Bytes);

impl PeerId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        PeerId(bytes.into())
    }

    /// Identity for a connection-flavor peer, as the transport's routing
    /// number in big-endian wire form.
    pub fn from_routing_id(id: u32) -> Self {
        PeerId(Bytes::copy_from_slice(&id.to_be_bytes()))
    }

    /// Recover the routing number. Only 4-byte identities qualify.
    pub fn routing_id(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.0.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The identity as a routing frame.
    pub fn to_frame(&self) -> Bytes {
        self.0.clone()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<Bytes> for PeerId {
    fn from(bytes: Bytes) -> Self {
        PeerId(bytes)
    }
}

impl From<&[u8]> for PeerId {
    fn from(bytes: &[u8]) -> Self {
        PeerId(Bytes::copy_from_slice(bytes))
    }
}

// Identities are routing material, often binary; log them as truncated hex.
impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 8 {
            write!(f, "{}", hex::encode(&self.0))
        } else {
            write!(f, "{}...", hex::encode(&self.0[..8]))
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

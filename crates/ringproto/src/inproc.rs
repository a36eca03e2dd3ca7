//! In-process connection-oriented transport.
//!
//! Backs the connection flavor of the endpoint adapter: a listener binds an
//! `inproc://` name in a process-global registry, peers connect to it, and
//! the transport assigns each peer a `u32` routing id on connect. Messages
//! are single-part buffers; multipart packing is [`crate::wire`]'s job,
//! exactly as a draft SERVER/CLIENT socket pair would see it.
//!
//! Routing ids come from a per-listener counter, so connecting never waits
//! on the listener. Connect notices and frames share the listener's one
//! channel, which keeps them ordered: a peer's connect is always processed
//! before its first frame, and the listener needs no background task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tracing::debug;

use crate::endpoint::TransportError;

/// Address scheme served by this transport.
pub const SCHEME: &str = "inproc://";

/// Per-endpoint channel depth. Beyond this, senders wait; backpressure is
/// the transport's responsibility.
const CHANNEL_DEPTH: usize = 1024;

enum Wire {
    Connect { id: u32, to_peer: mpsc::Sender<Bytes> },
    Frame { from: u32, payload: Bytes },
}

struct Registration {
    tx: mpsc::Sender<Wire>,
    ids: Arc<AtomicU32>,
}

static ENDPOINTS: Lazy<DashMap<String, Registration>> = Lazy::new(DashMap::new);

/// Server half: owns the routing table.
#[derive(Debug)]
pub struct Listener {
    name: String,
    rx: mpsc::Receiver<Wire>,
    peers: HashMap<u32, mpsc::Sender<Bytes>>,
}

/// Client half of one connection.
#[derive(Debug)]
pub struct Conn {
    routing_id: u32,
    tx: mpsc::Sender<Wire>,
    rx: mpsc::Receiver<Bytes>,
}

/// Bind a listener to `inproc://name`. Fails if the name is taken.
pub fn bind(address: &str) -> Result<Listener, TransportError> {
    let name = strip_scheme(address)?;
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    match ENDPOINTS.entry(name.to_owned()) {
        Entry::Occupied(_) => Err(TransportError::AddrInUse(address.to_owned())),
        Entry::Vacant(slot) => {
            slot.insert(Registration {
                tx,
                ids: Arc::new(AtomicU32::new(1)),
            });
            debug!(address, "inproc listener bound");
            Ok(Listener {
                name: name.to_owned(),
                rx,
                peers: HashMap::new(),
            })
        }
    }
}

/// Connect to a bound listener; the transport assigns the routing id.
pub async fn connect(address: &str) -> Result<Conn, TransportError> {
    let name = strip_scheme(address)?;
    let (to_listener, routing_id) = {
        let registration = ENDPOINTS
            .get(name)
            .ok_or_else(|| TransportError::ConnectionRefused(address.to_owned()))?;
        (
            registration.tx.clone(),
            registration.ids.fetch_add(1, Ordering::Relaxed),
        )
    };

    let (to_peer, rx) = mpsc::channel(CHANNEL_DEPTH);
    to_listener
        .send(Wire::Connect {
            id: routing_id,
            to_peer,
        })
        .await
        .map_err(|_| TransportError::ConnectionRefused(address.to_owned()))?;

    debug!(address, routing_id, "inproc peer connected");
    Ok(Conn {
        routing_id,
        tx: to_listener,
        rx,
    })
}

fn strip_scheme(address: &str) -> Result<&str, TransportError> {
    match address.strip_prefix(SCHEME) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(TransportError::ConnectionRefused(address.to_owned())),
    }
}

impl Listener {
    /// Receive one message, admitting new peers along the way.
    pub async fn recv(&mut self) -> Result<(u32, Bytes), TransportError> {
        loop {
            match self.rx.recv().await {
                Some(Wire::Connect { id, to_peer }) => {
                    self.peers.insert(id, to_peer);
                }
                Some(Wire::Frame { from, payload }) => return Ok((from, payload)),
                None => return Err(TransportError::Closed),
            }
        }
    }

    /// Send one message to a connected peer.
    pub async fn send(&mut self, to: u32, payload: Bytes) -> Result<(), TransportError> {
        let Some(tx) = self.peers.get(&to).cloned() else {
            return Err(TransportError::PeerGone);
        };
        if tx.send(payload).await.is_err() {
            self.peers.remove(&to);
            return Err(TransportError::PeerGone);
        }
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        ENDPOINTS.remove(&self.name);
    }
}

impl Conn {
    /// The routing id the listener knows this peer by.
    pub fn routing_id(&self) -> u32 {
        self.routing_id
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Wire::Frame {
                from: self.routing_id,
                payload,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn connect_before_bind_is_refused() {
        let err = connect("inproc://nobody-home").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let _listener = bind("inproc://double-bind-test").unwrap();
        assert!(matches!(
            bind("inproc://double-bind-test"),
            Err(TransportError::AddrInUse(_))
        ));
    }

    #[tokio::test]
    async fn name_is_released_on_drop() {
        {
            let _listener = bind("inproc://release-test").unwrap();
        }
        let _listener = bind("inproc://release-test").unwrap();
    }

    #[tokio::test]
    async fn peers_get_distinct_routing_ids() {
        let mut listener = bind("inproc://distinct-ids").unwrap();
        let mut a = connect("inproc://distinct-ids").await.unwrap();
        let mut b = connect("inproc://distinct-ids").await.unwrap();
        assert_ne!(a.routing_id(), b.routing_id());

        a.send(Bytes::from_static(b"from a")).await.unwrap();
        b.send(Bytes::from_static(b"from b")).await.unwrap();

        let (id1, first) = listener.recv().await.unwrap();
        let (id2, second) = listener.recv().await.unwrap();
        assert_eq!(id1, a.routing_id());
        assert_eq!(first.as_ref(), b"from a");
        assert_eq!(id2, b.routing_id());
        assert_eq!(second.as_ref(), b"from b");
    }

    #[tokio::test]
    async fn listener_routes_replies_by_id() {
        let mut listener = bind("inproc://routed-replies").unwrap();
        let mut a = connect("inproc://routed-replies").await.unwrap();
        let mut b = connect("inproc://routed-replies").await.unwrap();

        // Flush the connect notices so both peers are known.
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        b.send(Bytes::from_static(b"hello")).await.unwrap();
        let _ = listener.recv().await.unwrap();
        let _ = listener.recv().await.unwrap();

        listener
            .send(b.routing_id(), Bytes::from_static(b"for b"))
            .await
            .unwrap();
        assert_eq!(b.recv().await.unwrap().as_ref(), b"for b");

        listener
            .send(a.routing_id(), Bytes::from_static(b"for a"))
            .await
            .unwrap();
        assert_eq!(a.recv().await.unwrap().as_ref(), b"for a");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_reports_peer_gone() {
        let mut listener = bind("inproc://unknown-peer").unwrap();
        let err = listener
            .send(42, Bytes::from_static(b"into the void"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerGone));
    }

    #[tokio::test]
    async fn send_to_dropped_peer_reports_peer_gone() {
        let mut listener = bind("inproc://dropped-peer").unwrap();
        let mut conn = connect("inproc://dropped-peer").await.unwrap();
        let id = conn.routing_id();
        conn.send(Bytes::from_static(b"hello")).await.unwrap();
        let _ = listener.recv().await.unwrap();

        drop(conn);
        let err = listener.send(id, Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerGone));
    }

    #[tokio::test]
    async fn peer_send_after_listener_drop_reports_closed() {
        let listener = bind("inproc://closed-listener").unwrap();
        let mut conn = connect("inproc://closed-listener").await.unwrap();
        drop(listener);
        let err = conn.send(Bytes::from_static(b"anyone?")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}

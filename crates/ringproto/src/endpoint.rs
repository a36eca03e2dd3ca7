//! Identity & framing adapter.
//!
//! Erases the difference between the two transport flavors behind one
//! `(PeerId, frames)` surface:
//!
//! - **Envelope**: ROUTER/DEALER sockets. The routing identity arrives as
//!   the first frame and an empty delimiter separates it from the payload;
//!   dealers prepend the delimiter themselves to look like request-style
//!   peers.
//! - **Connection**: connection-oriented sockets with a transport-assigned
//!   `u32` routing id per peer. The whole frame group is packed into a
//!   single message body ([`crate::wire`]) and the routing id maps to a
//!   4-byte [`PeerId`].
//!
//! Each endpoint is a tagged variant chosen once at construction; a
//! flavor/address mismatch is a [`ConfigError`] and aborts construction.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use tracing::trace;
use zeromq::{DealerSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::inproc;
use crate::peer::PeerId;
use crate::wire;

/// Transport flavor behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Routing identities carried as explicit message frames.
    Envelope,
    /// Durable numeric identities assigned by the transport on connect.
    Connection,
}

impl Flavor {
    pub fn as_str(self) -> &'static str {
        match self {
            Flavor::Envelope => "envelope",
            Flavor::Connection => "connection",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "envelope" => Ok(Flavor::Envelope),
            "connection" => Ok(Flavor::Connection),
            other => Err(ConfigError::UnknownFlavor(other.to_owned())),
        }
    }
}

/// Endpoint construction rejected before any I/O happened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown transport flavor {0:?} (expected \"envelope\" or \"connection\")")]
    UnknownFlavor(String),
    #[error("address {address:?} is not usable with the {flavor} flavor")]
    AddressFlavor { flavor: Flavor, address: String },
}

/// Transport failures surfaced through the adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("socket error: {0}")]
    Socket(#[from] zeromq::ZmqError),
    #[error("endpoint closed")]
    Closed,
    #[error("peer is gone")]
    PeerGone,
    #[error("address already in use: {0}")]
    AddrInUse(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),
}

fn check_address(flavor: Flavor, address: &str) -> Result<(), ConfigError> {
    let is_inproc = address.starts_with(inproc::SCHEME);
    match flavor {
        Flavor::Envelope if is_inproc => Err(ConfigError::AddressFlavor {
            flavor,
            address: address.to_owned(),
        }),
        Flavor::Connection if !is_inproc => Err(ConfigError::AddressFlavor {
            flavor,
            address: address.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn to_zmq(frames: Vec<Bytes>) -> Result<ZmqMessage, TransportError> {
    let mut iter = frames.into_iter();
    let first = iter
        .next()
        .ok_or(TransportError::Envelope("empty frame group"))?;
    let mut msg = ZmqMessage::from(first.to_vec());
    for frame in iter {
        msg.push_back(frame);
    }
    Ok(msg)
}

/// Serverish side: binds, sees one [`PeerId`] per remote.
#[derive(Debug)]
pub struct ServerEndpoint {
    inner: ServerInner,
    local: String,
}

enum ServerInner {
    Envelope(RouterSocket),
    Connection(inproc::Listener),
}

impl std::fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerInner::Envelope(_) => f.write_str("ServerInner::Envelope(..)"),
            ServerInner::Connection(inner) => f.debug_tuple("ServerInner::Connection").field(inner).finish(),
        }
    }
}

impl ServerEndpoint {
    /// Bind a serverish endpoint. The returned endpoint knows its resolved
    /// local address (OS-assigned ports included).
    pub async fn bind(flavor: Flavor, address: &str) -> Result<Self, TransportError> {
        check_address(flavor, address)?;
        match flavor {
            Flavor::Envelope => {
                let mut socket = RouterSocket::new();
                let resolved = socket.bind(address).await?;
                Ok(ServerEndpoint {
                    inner: ServerInner::Envelope(socket),
                    local: resolved.to_string(),
                })
            }
            Flavor::Connection => {
                let listener = inproc::bind(address)?;
                Ok(ServerEndpoint {
                    inner: ServerInner::Connection(listener),
                    local: address.to_owned(),
                })
            }
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self.inner {
            ServerInner::Envelope(_) => Flavor::Envelope,
            ServerInner::Connection(_) => Flavor::Connection,
        }
    }

    /// The bound address, with any wildcard port resolved.
    pub fn local_addr(&self) -> &str {
        &self.local
    }

    /// Receive one frame group and the identity of its sender.
    pub async fn recv(&mut self) -> Result<(PeerId, VecDeque<Bytes>), TransportError> {
        match &mut self.inner {
            ServerInner::Envelope(socket) => {
                let mut frames = VecDeque::from(socket.recv().await?.into_vec());
                let identity = frames
                    .pop_front()
                    .ok_or(TransportError::Envelope("missing identity frame"))?;
                match frames.pop_front() {
                    Some(delim) if delim.is_empty() => {}
                    _ => return Err(TransportError::Envelope("missing delimiter frame")),
                }
                let peer = PeerId::from(identity);
                trace!(%peer, frames = frames.len(), "recv (envelope)");
                Ok((peer, frames))
            }
            ServerInner::Connection(listener) => {
                let (routing_id, payload) = listener.recv().await?;
                let frames = VecDeque::from(wire::decode(&payload)?);
                let peer = PeerId::from_routing_id(routing_id);
                trace!(%peer, frames = frames.len(), "recv (connection)");
                Ok((peer, frames))
            }
        }
    }

    /// Send one frame group to a known peer. Best-effort: the peer may have
    /// vanished, in which case the error is per-peer, not fatal.
    pub async fn send(&mut self, peer: &PeerId, frames: Vec<Bytes>) -> Result<(), TransportError> {
        match &mut self.inner {
            ServerInner::Envelope(socket) => {
                let mut all = Vec::with_capacity(frames.len() + 2);
                all.push(peer.to_frame());
                all.push(Bytes::new());
                all.extend(frames);
                socket.send(to_zmq(all)?).await?;
                Ok(())
            }
            ServerInner::Connection(listener) => {
                let routing_id = peer
                    .routing_id()
                    .ok_or(TransportError::Envelope("identity is not a routing id"))?;
                listener.send(routing_id, wire::encode(&frames)).await
            }
        }
    }
}

/// Clientish side: connects, the remote peer is implicit.
#[derive(Debug)]
pub struct ClientEndpoint {
    inner: ClientInner,
    remote: String,
}

enum ClientInner {
    Envelope(DealerSocket),
    Connection(inproc::Conn),
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientInner::Envelope(_) => f.write_str("ClientInner::Envelope(..)"),
            ClientInner::Connection(inner) => f.debug_tuple("ClientInner::Connection").field(inner).finish(),
        }
    }
}

impl ClientEndpoint {
    pub async fn connect(flavor: Flavor, address: &str) -> Result<Self, TransportError> {
        check_address(flavor, address)?;
        let inner = match flavor {
            Flavor::Envelope => {
                let mut socket = DealerSocket::new();
                socket.connect(address).await?;
                ClientInner::Envelope(socket)
            }
            Flavor::Connection => ClientInner::Connection(inproc::connect(address).await?),
        };
        Ok(ClientEndpoint {
            inner,
            remote: address.to_owned(),
        })
    }

    pub fn flavor(&self) -> Flavor {
        match self.inner {
            ClientInner::Envelope(_) => Flavor::Envelope,
            ClientInner::Connection(_) => Flavor::Connection,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    pub async fn recv(&mut self) -> Result<VecDeque<Bytes>, TransportError> {
        match &mut self.inner {
            ClientInner::Envelope(socket) => {
                let mut frames = VecDeque::from(socket.recv().await?.into_vec());
                match frames.pop_front() {
                    Some(delim) if delim.is_empty() => {}
                    _ => return Err(TransportError::Envelope("missing delimiter frame")),
                }
                Ok(frames)
            }
            ClientInner::Connection(conn) => {
                let payload = conn.recv().await?;
                Ok(VecDeque::from(wire::decode(&payload)?))
            }
        }
    }

    pub async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        match &mut self.inner {
            ClientInner::Envelope(socket) => {
                // Empty delimiter first, impersonating a request-style peer.
                let mut all = Vec::with_capacity(frames.len() + 1);
                all.push(Bytes::new());
                all.extend(frames);
                socket.send(to_zmq(all)?).await?;
                Ok(())
            }
            ClientInner::Connection(conn) => conn.send(wire::encode(&frames)).await,
        }
    }
}

//! 7/MDP v0.1 framing constants and helpers.
//!
//! The broker speaks two sub-protocols, distinguished by the first payload
//! frame after the transport envelope:
//!
//! ```text
//! client:  [MDPC01] [service] [body ...]
//! worker:  [MDPW01] [command] [tail ...]
//! ```
//!
//! Worker commands are single-byte frames. The tail depends on the command:
//!
//! ```text
//! READY      0x01   [service]
//! REQUEST    0x02   [client peer] [empty] [body ...]   (broker -> worker)
//! REPLY      0x03   [client peer] [empty] [body ...]   (worker -> broker)
//! HEARTBEAT  0x04   (none)
//! DISCONNECT 0x05   (none)
//! ```
//!
//! The builders here produce the payload frame group only; transport
//! routing (identity frames, envelope delimiters, routing ids) is the
//! adapter's business.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::peer::PeerId;

/// Client sub-protocol header frame.
pub const CLIENT_IDENT: &[u8] = b"MDPC01";

/// Worker sub-protocol header frame.
pub const WORKER_IDENT: &[u8] = b"MDPW01";

/// Reserved service-name prefix answered by the broker itself.
pub const MMI_PREFIX: &[u8] = b"mmi.";

/// Interval between broker and worker heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Missed heartbeats tolerated before a peer is presumed dead.
pub const HEARTBEAT_LIVENESS: u32 = 3;

/// Silence window after which a worker is expired.
pub fn heartbeat_expiry() -> Duration {
    HEARTBEAT_INTERVAL * HEARTBEAT_LIVENESS
}

/// Worker command codes, carried as single-byte frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,
}

impl Command {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Command::Ready),
            0x02 => Ok(Command::Request),
            0x03 => Ok(Command::Reply),
            0x04 => Ok(Command::Heartbeat),
            0x05 => Ok(Command::Disconnect),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The command as a one-byte frame.
    pub fn frame(self) -> Bytes {
        match self {
            Command::Ready => Bytes::from_static(&[0x01]),
            Command::Request => Bytes::from_static(&[0x02]),
            Command::Reply => Bytes::from_static(&[0x03]),
            Command::Heartbeat => Bytes::from_static(&[0x04]),
            Command::Disconnect => Bytes::from_static(&[0x05]),
        }
    }

    /// Parse a command frame. Anything but exactly one byte is malformed.
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        match frame {
            [byte] => Self::from_u8(*byte),
            _ => Err(ProtocolError::MissingFrame("worker command")),
        }
    }
}

/// Violations of the frame layouts above.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown protocol header")]
    UnknownHeader,
    #[error("unknown worker command {0:#04x}")]
    UnknownCommand(u8),
    #[error("missing frame: {0}")]
    MissingFrame(&'static str),
}

/// Consume a worker-protocol header and command, leaving the tail in place.
pub fn parse_worker(frames: &mut VecDeque<Bytes>) -> Result<Command, ProtocolError> {
    match frames.pop_front() {
        Some(header) if header == WORKER_IDENT => {}
        Some(_) => return Err(ProtocolError::UnknownHeader),
        None => return Err(ProtocolError::MissingFrame("protocol header")),
    }
    let command = frames
        .pop_front()
        .ok_or(ProtocolError::MissingFrame("worker command"))?;
    Command::from_frame(&command)
}

/// Consume a client-protocol header, returning the service frame and
/// leaving the body in place.
pub fn parse_client(frames: &mut VecDeque<Bytes>) -> Result<Bytes, ProtocolError> {
    match frames.pop_front() {
        Some(header) if header == CLIENT_IDENT => {}
        Some(_) => return Err(ProtocolError::UnknownHeader),
        None => return Err(ProtocolError::MissingFrame("protocol header")),
    }
    frames
        .pop_front()
        .ok_or(ProtocolError::MissingFrame("service name"))
}

/// `[MDPC01] [service] [body...]`: client request, and the broker's reply
/// to a client (same layout).
pub fn client_frames(service: &[u8], body: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(2 + body.len());
    frames.push(Bytes::from_static(CLIENT_IDENT));
    frames.push(Bytes::copy_from_slice(service));
    frames.extend(body);
    frames
}

/// `[MDPW01] [READY] [service]`: worker registration.
pub fn worker_ready(service: &str) -> Vec<Bytes> {
    vec![
        Bytes::from_static(WORKER_IDENT),
        Command::Ready.frame(),
        Bytes::copy_from_slice(service.as_bytes()),
    ]
}

/// `[MDPW01] [REQUEST] [client peer] [empty] [body...]`: broker handing a
/// queued request to a worker.
pub fn worker_request(route: Bytes, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(4 + body.len());
    frames.push(Bytes::from_static(WORKER_IDENT));
    frames.push(Command::Request.frame());
    frames.push(route);
    frames.push(Bytes::new());
    frames.extend(body);
    frames
}

/// `[MDPW01] [REPLY] [client peer] [empty] [body...]`: worker answering.
pub fn worker_reply(reply_to: &PeerId, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(4 + body.len());
    frames.push(Bytes::from_static(WORKER_IDENT));
    frames.push(Command::Reply.frame());
    frames.push(reply_to.to_frame());
    frames.push(Bytes::new());
    frames.extend(body);
    frames
}

/// `[MDPW01] [HEARTBEAT]`
pub fn worker_heartbeat() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER_IDENT), Command::Heartbeat.frame()]
}

/// `[MDPW01] [DISCONNECT]`
pub fn worker_disconnect() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER_IDENT), Command::Disconnect.frame()]
}

//! ringproto - Majordomo protocol layer for the ringleader broker
//!
//! This crate holds everything both halves of the protocol share: the MDP
//! frame constants and layouts, the opaque [`PeerId`], the identity &
//! framing adapter over the two transport flavors, and the worker/client
//! runtimes that application code drives against a running broker.

pub mod client;
pub mod endpoint;
pub mod inproc;
pub mod interrupt;
pub mod mdp;
pub mod peer;
pub mod wire;
pub mod worker;

pub use client::{Client, ClientConfig};
pub use endpoint::{ClientEndpoint, ConfigError, Flavor, ServerEndpoint, TransportError};
pub use mdp::{Command, ProtocolError};
pub use peer::PeerId;
pub use worker::{Worker, WorkerConfig};

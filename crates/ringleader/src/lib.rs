//! ringleader - a Majordomo-pattern service broker
//!
//! Clients submit requests addressed to named services; workers register
//! under a service name and receive dispatched requests; the broker
//! mediates liveness, load distribution, and routing. Works over both an
//! envelope transport (ROUTER/DEALER) and a connection-oriented transport
//! with numeric routing ids; see [`ringproto`] for the protocol layer.

pub mod broker;
pub mod config;
pub mod registry;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use registry::{Registry, ServiceId, WorkerId};

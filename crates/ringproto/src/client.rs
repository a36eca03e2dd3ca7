//! Client runtime.
//!
//! Thin counterpart to the worker runtime: address a request to a named
//! service, then wait (with a timeout) for the matching reply. The broker
//! never synthesizes error replies, so an unstaffed service simply times
//! out here.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use crate::endpoint::{ClientEndpoint, Flavor, TransportError};
use crate::mdp;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long [`Client::recv`] waits before giving up.
    pub recv_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_timeout: mdp::HEARTBEAT_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

pub struct Client {
    endpoint: ClientEndpoint,
    config: ClientConfig,
}

impl Client {
    pub async fn connect(
        flavor: Flavor,
        address: &str,
        config: ClientConfig,
    ) -> Result<Self, TransportError> {
        let endpoint = ClientEndpoint::connect(flavor, address).await?;
        debug!(address, "client connected");
        Ok(Client { endpoint, config })
    }

    /// Submit a request to a named service.
    pub async fn send(&mut self, service: &str, body: Vec<Bytes>) -> Result<(), TransportError> {
        self.endpoint
            .send(mdp::client_frames(service.as_bytes(), body))
            .await
    }

    /// Wait for the next reply: `(service, body)`. `None` on timeout.
    pub async fn recv(&mut self) -> Result<Option<(String, Vec<Bytes>)>, TransportError> {
        loop {
            let polled = tokio::time::timeout(self.config.recv_timeout, self.endpoint.recv()).await;
            let mut frames = match polled {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };

            let service = match mdp::parse_client(&mut frames) {
                Ok(service) => service,
                Err(err) => {
                    error!(error = %err, "dropping malformed reply");
                    continue;
                }
            };
            let service = String::from_utf8_lossy(&service).into_owned();
            return Ok(Some((service, frames.into_iter().collect())));
        }
    }
}

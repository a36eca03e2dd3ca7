//! Worker runtime.
//!
//! The application half of the worker sub-protocol: announce a service with
//! READY, then alternate between sending the previous reply and waiting for
//! the next request. Liveness is tracked against broker heartbeats; a
//! silent broker triggers a reconnect (and a fresh READY), as does an
//! explicit DISCONNECT.
//!
//! ```ignore
//! let mut worker = Worker::connect(flavor, addr, "echo", WorkerConfig::default()).await?;
//! let mut reply = Vec::new();
//! loop {
//!     let request = worker.work(reply).await?;
//!     if request.is_empty() {
//!         break; // interrupted
//!     }
//!     reply = request;
//! }
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::endpoint::{ClientEndpoint, Flavor, TransportError};
use crate::interrupt;
use crate::mdp::{self, Command};
use crate::peer::PeerId;

/// Tuning for the worker's liveness state machine.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between outbound heartbeats; also the poll timeout.
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before reconnecting.
    pub liveness: u32,
    /// Pause before a liveness-triggered reconnect.
    pub reconnect: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: mdp::HEARTBEAT_INTERVAL,
            liveness: mdp::HEARTBEAT_LIVENESS,
            reconnect: mdp::HEARTBEAT_INTERVAL,
        }
    }
}

impl WorkerConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_liveness(mut self, liveness: u32) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_reconnect(mut self, reconnect: Duration) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// One registered worker: owns its endpoint and the protocol state machine.
pub struct Worker {
    endpoint: ClientEndpoint,
    flavor: Flavor,
    address: String,
    service: String,
    config: WorkerConfig,
    liveness: u32,
    heartbeat_at: Instant,
    reply_to: Option<PeerId>,
}

impl Worker {
    /// Connect to the broker and announce the service.
    pub async fn connect(
        flavor: Flavor,
        address: &str,
        service: &str,
        config: WorkerConfig,
    ) -> Result<Self, TransportError> {
        let mut endpoint = ClientEndpoint::connect(flavor, address).await?;
        endpoint.send(mdp::worker_ready(service)).await?;
        debug!(address, service, "worker connected");
        Ok(Worker {
            endpoint,
            flavor,
            address: address.to_owned(),
            service: service.to_owned(),
            liveness: config.liveness,
            heartbeat_at: Instant::now() + config.heartbeat_interval,
            config,
            reply_to: None,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Tear the connection down and register afresh. The broker treats the
    /// new READY as a new worker; the stale registration ages out.
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        debug!(address = %self.address, service = %self.service, "reconnecting to broker");
        self.endpoint = ClientEndpoint::connect(self.flavor, &self.address).await?;
        self.endpoint.send(mdp::worker_ready(&self.service)).await?;
        self.liveness = self.config.liveness;
        self.heartbeat_at = Instant::now() + self.config.heartbeat_interval;
        Ok(())
    }

    async fn pause_and_reconnect(&mut self) -> Result<(), TransportError> {
        tokio::time::sleep(self.config.reconnect).await;
        self.reconnect().await
    }

    /// Send the reply from the last request (if any) and wait for the next
    /// request body. Returns an empty frame group when interrupted.
    pub async fn work(&mut self, reply: Vec<Bytes>) -> Result<Vec<Bytes>, TransportError> {
        if !reply.is_empty() {
            if let Some(reply_to) = self.reply_to.take() {
                let frames = mdp::worker_reply(&reply_to, reply);
                if let Err(err) = self.endpoint.send(frames).await {
                    warn!(error = %err, "reply send failed, reconnecting");
                    self.pause_and_reconnect().await?;
                }
            }
        }

        loop {
            if interrupt::interrupted() {
                debug!(service = %self.service, "interrupt received, leaving work loop");
                return Ok(Vec::new());
            }

            let polled =
                tokio::time::timeout(self.config.heartbeat_interval, self.endpoint.recv()).await;
            match polled {
                Ok(Ok(frames)) => {
                    self.liveness = self.config.liveness;
                    if let Some(request) = self.process(frames).await? {
                        return Ok(request);
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "lost broker connection");
                    self.pause_and_reconnect().await?;
                }
                Err(_) => {
                    self.liveness = self.liveness.saturating_sub(1);
                    if self.liveness == 0 {
                        debug!("broker unresponsive, retrying");
                        self.pause_and_reconnect().await?;
                    }
                }
            }

            if Instant::now() >= self.heartbeat_at {
                if let Err(err) = self.endpoint.send(mdp::worker_heartbeat()).await {
                    warn!(error = %err, "heartbeat send failed, reconnecting");
                    self.pause_and_reconnect().await?;
                } else {
                    self.heartbeat_at += self.config.heartbeat_interval;
                }
            }
        }
    }

    /// Handle one inbound frame group; returns the request body if it was
    /// a REQUEST.
    async fn process(
        &mut self,
        mut frames: VecDeque<Bytes>,
    ) -> Result<Option<Vec<Bytes>>, TransportError> {
        let command = match mdp::parse_worker(&mut frames) {
            Ok(command) => command,
            Err(err) => {
                error!(error = %err, "dropping malformed broker message");
                return Ok(None);
            }
        };

        match command {
            Command::Request => {
                let Some(reply_to) = frames.pop_front() else {
                    error!("REQUEST without a reply route");
                    return Ok(None);
                };
                self.reply_to = Some(PeerId::from(reply_to));
                match frames.pop_front() {
                    Some(delim) if delim.is_empty() => {}
                    _ => {
                        error!("REQUEST without a delimiter frame");
                        self.reply_to = None;
                        return Ok(None);
                    }
                }
                Ok(Some(frames.into_iter().collect()))
            }
            Command::Heartbeat => Ok(None),
            Command::Disconnect => {
                debug!("broker asked us to disconnect");
                self.reconnect().await?;
                Ok(None)
            }
            Command::Ready | Command::Reply => {
                error!(command = ?command, "invalid command from broker");
                Ok(None)
            }
        }
    }
}

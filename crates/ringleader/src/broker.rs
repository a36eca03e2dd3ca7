//! The broker: event loop, dispatch, and liveness.
//!
//! Single-task cooperative loop. Every inbound message is classified by its
//! header frame: client traffic feeds the service queues and the
//! dispatcher, worker traffic drives the registry and the heartbeat state
//! machine. The only suspension point is the poll; everything between
//! polls runs to completion against exclusively-owned state.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use ringproto::endpoint::{Flavor, ServerEndpoint, TransportError};
use ringproto::interrupt;
use ringproto::mdp::{self, Command};
use ringproto::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::registry::{Registry, ServiceId, WorkerId};

pub struct Broker {
    endpoint: ServerEndpoint,
    registry: Registry,
    config: BrokerConfig,
    /// Next instant at which to emit heartbeats to idle workers.
    heartbeat_at: Instant,
}

impl Broker {
    /// Bind a broker endpoint of the given flavor.
    pub async fn bind(
        flavor: Flavor,
        address: &str,
        config: BrokerConfig,
    ) -> Result<Self, TransportError> {
        let endpoint = ServerEndpoint::bind(flavor, address).await?;
        Ok(Broker {
            endpoint,
            registry: Registry::new(),
            heartbeat_at: Instant::now() + config.heartbeat_interval,
            config,
        })
    }

    /// The bound address, with any wildcard port resolved.
    pub fn local_addr(&self) -> &str {
        self.endpoint.local_addr()
    }

    /// Diagnostic snapshot of the registry.
    pub fn summary(&self) -> serde_json::Value {
        self.registry.summary()
    }

    /// Broker until interrupted or the supervisor cancels. Receive errors
    /// are fatal and propagate; sends are best-effort throughout.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), TransportError> {
        info!(
            address = %self.endpoint.local_addr(),
            flavor = %self.endpoint.flavor(),
            "broker started"
        );
        self.heartbeat_at = Instant::now() + self.config.heartbeat_interval;

        while !interrupt::interrupted() {
            let window = self.heartbeat_at.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("supervisor requested shutdown");
                    break;
                }
                polled = tokio::time::timeout(window, self.endpoint.recv()) => {
                    match polled {
                        Ok(Ok((sender, frames))) => self.process(sender, frames).await,
                        // A peer that cannot frame a message correctly is its
                        // own problem; only the socket failing is ours.
                        Ok(Err(err @ (TransportError::Envelope(_) | TransportError::Wire(_)))) => {
                            error!(error = %err, "dropping malformed message");
                        }
                        Ok(Err(err)) => {
                            error!(error = %err, "receive failed, stopping broker");
                            return Err(err);
                        }
                        Err(_) => {} // heartbeat tick due
                    }
                }
            }
            self.proc_heartbeat(Instant::now()).await;
        }

        info!("broker stopped");
        Ok(())
    }

    /// Receive and process exactly one message.
    pub async fn proc_one(&mut self) -> Result<(), TransportError> {
        let (sender, frames) = self.endpoint.recv().await?;
        self.process(sender, frames).await;
        Ok(())
    }

    async fn process(&mut self, sender: PeerId, mut frames: VecDeque<Bytes>) {
        let Some(header) = frames.pop_front() else {
            error!(peer = %sender, "dropping empty message");
            return;
        };
        if header == mdp::CLIENT_IDENT {
            self.client_process(sender, frames).await;
        } else if header == mdp::WORKER_IDENT {
            self.worker_process(sender, frames).await;
        } else {
            error!(peer = %sender, "dropping message with unknown header");
        }
    }

    /// Queue a client request on its service, or answer `mmi.*` locally.
    async fn client_process(&mut self, sender: PeerId, mut frames: VecDeque<Bytes>) {
        let Some(service_frame) = frames.pop_front() else {
            error!(client = %sender, "dropping request without a service frame");
            return;
        };
        if service_frame.starts_with(mdp::MMI_PREFIX) {
            self.service_internal(&sender, &service_frame, frames).await;
            return;
        }

        let name = String::from_utf8_lossy(&service_frame).into_owned();
        let sid = self.registry.service_require(&name);

        // Reply route first, then the body as received.
        let mut payload = Vec::with_capacity(1 + frames.len());
        payload.push(sender.to_frame());
        payload.extend(frames);
        self.registry.push_request(sid, payload);
        debug!(client = %sender, service = %name, "queued request");

        self.service_dispatch(sid).await;
    }

    /// Answer broker introspection requests without involving any worker.
    async fn service_internal(
        &mut self,
        client: &PeerId,
        service_frame: &Bytes,
        mut frames: VecDeque<Bytes>,
    ) {
        let code: &'static [u8] = if service_frame.as_ref() == b"mmi.service" {
            let Some(target) = frames.pop_front() else {
                error!(client = %client, "dropping mmi.service query without a target");
                return;
            };
            let name = String::from_utf8_lossy(&target);
            let staffed = self
                .registry
                .lookup_service(&name)
                .map(|sid| self.registry.service(sid).workers > 0)
                .unwrap_or(false);
            if staffed {
                b"200"
            } else {
                b"404"
            }
        } else {
            b"501"
        };

        let reply = mdp::client_frames(service_frame, vec![Bytes::from_static(code)]);
        self.send_best_effort(client, reply).await;
    }

    /// Drive the worker sub-protocol for one inbound command.
    async fn worker_process(&mut self, sender: PeerId, mut frames: VecDeque<Bytes>) {
        let Some(command_frame) = frames.pop_front() else {
            error!(worker = %sender, "dropping worker message without a command");
            return;
        };
        let command = Command::from_frame(&command_frame);

        let (wid, worker_ready) = self.registry.worker_require(&sender);
        match command {
            Ok(Command::Ready) => {
                if worker_ready {
                    warn!(worker = %sender, "duplicate READY, disconnecting");
                    self.delete_worker(wid, true).await;
                    return;
                }
                if sender.starts_with(mdp::MMI_PREFIX) {
                    warn!(worker = %sender, "worker identity uses the reserved mmi. prefix");
                    self.delete_worker(wid, true).await;
                    return;
                }
                let Some(service_frame) = frames.pop_front() else {
                    warn!(worker = %sender, "READY without a service name");
                    self.delete_worker(wid, true).await;
                    return;
                };
                let name = String::from_utf8_lossy(&service_frame).into_owned();
                let sid = self.registry.service_require(&name);
                self.registry.attach(wid, sid);
                info!(worker = %sender, service = %name, "worker registered");
                self.worker_waiting(wid).await;
            }
            Ok(Command::Reply) => {
                if !worker_ready {
                    warn!(worker = %sender, "REPLY before READY, disconnecting");
                    self.delete_worker(wid, true).await;
                    return;
                }
                let Some(sid) = self.registry.worker(wid).service else {
                    warn!(worker = %sender, "REPLY from an unattached worker, disconnecting");
                    self.delete_worker(wid, true).await;
                    return;
                };
                let Some(client) = frames.pop_front() else {
                    warn!(worker = %sender, "REPLY without a client route, disconnecting");
                    self.delete_worker(wid, true).await;
                    return;
                };
                match frames.pop_front() {
                    Some(delim) if delim.is_empty() => {}
                    _ => {
                        warn!(worker = %sender, "REPLY without a delimiter, disconnecting");
                        self.delete_worker(wid, true).await;
                        return;
                    }
                }
                let client = PeerId::from(client);
                let service_name = self.registry.service(sid).name.clone();
                let reply =
                    mdp::client_frames(service_name.as_bytes(), frames.into_iter().collect());
                self.send_best_effort(&client, reply).await;
                debug!(worker = %sender, client = %client, service = %service_name, "relayed reply");
                self.worker_waiting(wid).await;
            }
            Ok(Command::Heartbeat) => {
                if !worker_ready {
                    warn!(worker = %sender, "HEARTBEAT before READY, disconnecting");
                    self.delete_worker(wid, true).await;
                    return;
                }
                let expiry = Instant::now() + self.config.heartbeat_expiry();
                self.registry.worker_mut(wid).expiry = expiry;
            }
            Ok(Command::Disconnect) => {
                debug!(worker = %sender, "worker disconnected");
                self.delete_worker(wid, false).await;
            }
            Ok(Command::Request) | Err(_) => {
                error!(worker = %sender, "invalid worker command");
            }
        }
    }

    /// Mark a worker idle and see whether its service has work for it.
    async fn worker_waiting(&mut self, wid: WorkerId) {
        let expiry = Instant::now() + self.config.heartbeat_expiry();
        self.registry.mark_waiting(wid, expiry);
        let Some(sid) = self.registry.worker(wid).service else {
            return;
        };
        self.service_dispatch(sid).await;
    }

    /// Match queued requests against idle workers, freshest worker first.
    async fn service_dispatch(&mut self, sid: ServiceId) {
        self.purge_workers(Instant::now()).await;

        loop {
            let Some(wid) = self.registry.freshest_waiting(sid) else {
                break;
            };
            let Some(request) = self.registry.pop_request(sid) else {
                break;
            };
            let mut request = VecDeque::from(request);
            let Some(route) = request.pop_front() else {
                // Queued payloads always carry the reply route; an empty one
                // is unusable, drop it and keep the worker idle.
                warn!("dropping queued request without a reply route");
                continue;
            };

            let peer = self.registry.worker(wid).identity.clone();
            self.registry.unmark_waiting(wid);
            let frames = mdp::worker_request(route, request.into_iter().collect());
            self.send_best_effort(&peer, frames).await;
            debug!(worker = %peer, service = %self.registry.service(sid).name, "dispatched request");
        }
    }

    /// Emit heartbeats to every idle worker once the tick is due. The tick
    /// advances by one interval, never realigning to `now`; a missed tick
    /// is late, not replayed.
    async fn proc_heartbeat(&mut self, now: Instant) {
        if now < self.heartbeat_at {
            return;
        }
        self.purge_workers(now).await;
        for wid in self.registry.waiting_ids() {
            let peer = self.registry.worker(wid).identity.clone();
            self.send_best_effort(&peer, mdp::worker_heartbeat()).await;
        }
        self.heartbeat_at += self.config.heartbeat_interval;
    }

    /// Delete idle workers whose expiry has passed. Collect-then-delete so
    /// iteration never sees its own mutations.
    async fn purge_workers(&mut self, now: Instant) {
        for wid in self.registry.expired(now) {
            info!(worker = %self.registry.worker(wid).identity, "purging expired worker");
            self.delete_worker(wid, false).await;
        }
    }

    /// Remove a worker, optionally telling it to go away first.
    async fn delete_worker(&mut self, wid: WorkerId, send_disconnect: bool) {
        if send_disconnect {
            let peer = self.registry.worker(wid).identity.clone();
            self.send_best_effort(&peer, mdp::worker_disconnect()).await;
        }
        self.registry.delete_worker(wid);
    }

    /// Delivery is best-effort: a vanished peer costs a warning, never the
    /// broker.
    async fn send_best_effort(&mut self, peer: &PeerId, frames: Vec<Bytes>) {
        if let Err(err) = self.endpoint.send(peer, frames).await {
            warn!(peer = %peer, error = %err, "send failed, dropping message");
        }
    }
}

//! LBN session engine.
//!
//! One long-lived task owning the authoritative session to the LBN node:
//!
//! ```text
//!  Disconnected ──connect──▶ Connected ──register──▶ Registered
//!       ▲                                                │
//!       │                                     initial neighborhood fetch
//!       │ 10 s retry                                     │
//!       │                                                ▼
//!       └──── drop / deregister ◀── receive loop ──  InSync
//! ```
//!
//! Readiness latches once the initial fetch commits and never regresses.
//! Every suspension point — connect, read, write, the retry delay — is
//! raced against the shutdown broadcast. Errors never cross `run()`:
//! transport and protocol failures become a reconnect, and the LBN
//! replays anything the reconciler did not commit (re-application is
//! idempotent).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use vicinity_core::proto::{
    self, LocalServiceRequest, LocalServiceResponse, Message, MessageBuilder, MessageKind,
    Request, Response, ServiceKind, ServiceProfile, Status,
};
use vicinity_services::{NeighborhoodReconciler, Readiness};

use crate::transport::{self, FrameEvent, FrameReader, FrameWriter, TransportError};

/// Delay between reconnect attempts after any session exit.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Bounded wait for the deregistration acknowledgement during teardown.
pub const DEREGISTER_WAIT: Duration = Duration::from_secs(5);

/// Why the current session ended.
enum SessionEnd {
    /// Shutdown was signaled; leave the reconnect loop.
    Shutdown,
    /// The session died; reconnect after the delay.
    Dropped,
}

/// Control flow out of a request/response exchange.
enum Flow {
    Shutdown,
    Abort,
}

pub struct LbnSession {
    endpoint: String,
    profile: ServiceProfile,
    reconciler: Arc<NeighborhoodReconciler>,
    readiness: Readiness,
    shutdown: broadcast::Receiver<()>,
    reconnect_delay: Duration,
}

impl LbnSession {
    pub fn new(
        endpoint: String,
        profile: ServiceProfile,
        reconciler: Arc<NeighborhoodReconciler>,
        readiness: Readiness,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            endpoint,
            profile,
            reconciler,
            readiness,
            shutdown,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// Override the reconnect delay. Tests use a short one.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// The persistent reconnect loop. Returns only on shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let endpoint = self.endpoint.clone();
            let connected = tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("LBN session shutting down");
                    return Ok(());
                }
                result = transport::connect(&endpoint) => result,
            };

            match connected {
                Ok((reader, writer)) => {
                    info!(endpoint = %self.endpoint, "connected to LBN node");
                    if let SessionEnd::Shutdown = self.run_session(reader, writer).await {
                        info!("LBN session shutting down");
                        return Ok(());
                    }
                }
                Err(e) => {
                    info!(endpoint = %self.endpoint, error = %e, "LBN connect failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("LBN session shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Drive one connected session from registration to its end.
    async fn run_session(&mut self, mut reader: FrameReader, writer: FrameWriter) -> SessionEnd {
        let mut builder = MessageBuilder::new();

        // Registration handshake.
        let request = builder.register_service(self.profile.clone());
        let response = match self.request_response(&mut reader, &writer, &request).await {
            Ok(r) => r,
            Err(Flow::Shutdown) => return SessionEnd::Shutdown,
            Err(Flow::Abort) => return SessionEnd::Dropped,
        };
        match response.kind {
            MessageKind::Response(Response::LocalService(
                LocalServiceResponse::RegisterService(Status::Ok),
            )) => {}
            MessageKind::Response(Response::LocalService(
                LocalServiceResponse::RegisterService(status),
            )) => {
                warn!(status = ?status, "LBN refused registration");
                return SessionEnd::Dropped;
            }
            _ => return SessionEnd::Dropped,
        }
        debug!("registered with LBN node");

        // Initial neighborhood fetch.
        let request = builder.get_neighbour_nodes();
        let response = match self.request_response(&mut reader, &writer, &request).await {
            Ok(r) => r,
            Err(Flow::Shutdown) => return SessionEnd::Shutdown,
            Err(Flow::Abort) => return SessionEnd::Dropped,
        };
        let nodes = match response.kind {
            MessageKind::Response(Response::LocalService(
                LocalServiceResponse::GetNeighbourNodesByDistanceLocal {
                    status: Status::Ok,
                    nodes,
                },
            )) => nodes,
            MessageKind::Response(Response::LocalService(
                LocalServiceResponse::GetNeighbourNodesByDistanceLocal { status, .. },
            )) => {
                warn!(status = ?status, "LBN refused neighborhood query");
                return SessionEnd::Dropped;
            }
            _ => return SessionEnd::Dropped,
        };

        if let Err(e) = self.reconciler.apply_initial_set(&nodes).await {
            error!(error = %e, "initial neighborhood sync failed");
            return SessionEnd::Dropped;
        }
        self.readiness.latch();
        info!(neighbors = nodes.len(), "neighborhood initialized");

        // Receive/dispatch loop.
        loop {
            let event = tokio::select! {
                _ = self.shutdown.recv() => {
                    self.deregister(&mut reader, &writer, &mut builder).await;
                    return SessionEnd::Shutdown;
                }
                event = reader.read_frame() => event,
            };

            let frame = match event {
                Ok(FrameEvent::Frame(frame)) => frame,
                Ok(FrameEvent::Eof) => {
                    info!("LBN closed the connection");
                    return SessionEnd::Dropped;
                }
                Err(TransportError::Violation(e)) => {
                    warn!(error = %e, "unreadable frame from LBN");
                    self.send_violation(&writer, None).await;
                    return SessionEnd::Dropped;
                }
                Err(e) => {
                    info!(error = %e, "LBN read failed");
                    return SessionEnd::Dropped;
                }
            };

            let message = match proto::decode_body(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "undecodable message from LBN");
                    self.send_violation(&writer, None).await;
                    return SessionEnd::Dropped;
                }
            };

            match message.kind {
                MessageKind::Request(Request::LocalService(
                    LocalServiceRequest::NeighbourhoodChangedNotification(changes),
                )) => {
                    debug!(id = message.id, changes = changes.len(), "neighborhood change batch");
                    match self.reconciler.apply_change_batch(&changes).await {
                        Ok(()) => {
                            let reply = MessageBuilder::neighbourhood_changed_response(
                                message.id,
                                Status::Ok,
                            );
                            if !self.send(&writer, &reply).await {
                                return SessionEnd::Dropped;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "failed to apply neighborhood changes");
                            let reply = MessageBuilder::internal_error_response(message.id);
                            self.best_effort_send(&writer, &reply).await;
                            // Dropping makes the LBN replay the delta on
                            // reconnect; re-application is idempotent.
                            return SessionEnd::Dropped;
                        }
                    }
                }
                MessageKind::Request(_) => {
                    warn!(id = message.id, "unexpected request kind from LBN");
                    self.send_violation(&writer, Some(message.id)).await;
                    return SessionEnd::Dropped;
                }
                MessageKind::Response(_) => {
                    warn!(id = message.id, "unsolicited response from LBN");
                    self.send_violation(&writer, None).await;
                    return SessionEnd::Dropped;
                }
            }
        }
    }

    /// Send one request and read its correlated response. Anything that
    /// does not correlate is answered with a protocol violation.
    async fn request_response(
        &mut self,
        reader: &mut FrameReader,
        writer: &FrameWriter,
        request: &Message,
    ) -> Result<Message, Flow> {
        if !self.send(writer, request).await {
            return Err(Flow::Abort);
        }

        let event = tokio::select! {
            _ = self.shutdown.recv() => return Err(Flow::Shutdown),
            event = reader.read_frame() => event,
        };
        let frame = match event {
            Ok(FrameEvent::Frame(frame)) => frame,
            Ok(FrameEvent::Eof) => {
                info!("LBN closed the connection");
                return Err(Flow::Abort);
            }
            Err(TransportError::Violation(e)) => {
                warn!(error = %e, "unreadable frame from LBN");
                self.send_violation(writer, None).await;
                return Err(Flow::Abort);
            }
            Err(e) => {
                info!(error = %e, "LBN read failed");
                return Err(Flow::Abort);
            }
        };

        let response = match proto::decode_body(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "undecodable message from LBN");
                self.send_violation(writer, None).await;
                return Err(Flow::Abort);
            }
        };
        if !proto::response_matches(request, &response) {
            warn!(
                request_id = request.id,
                response_id = response.id,
                "uncorrelated message while awaiting response"
            );
            let id = match response.kind {
                // An inbound request carries an id we can echo back.
                MessageKind::Request(_) => Some(response.id),
                MessageKind::Response(_) => None,
            };
            self.send_violation(writer, id).await;
            return Err(Flow::Abort);
        }
        Ok(response)
    }

    /// Graceful teardown: deregister and give the LBN a bounded window
    /// to acknowledge. Failures are logged, never raised.
    async fn deregister(
        &self,
        reader: &mut FrameReader,
        writer: &FrameWriter,
        builder: &mut MessageBuilder,
    ) {
        let request = builder.deregister_service(ServiceKind::Profile);
        if !self.best_effort_send(writer, &request).await {
            return;
        }

        match tokio::time::timeout(DEREGISTER_WAIT, reader.read_frame()).await {
            Ok(Ok(FrameEvent::Frame(frame))) => match proto::decode_body(&frame) {
                Ok(ack) if proto::response_matches(&request, &ack) => {
                    debug!("deregistered from LBN node");
                }
                Ok(ack) => {
                    debug!(id = ack.id, "unexpected deregistration acknowledgement");
                }
                Err(e) => {
                    debug!(error = %e, "undecodable deregistration acknowledgement");
                }
            },
            Ok(_) => debug!("connection ended before deregistration acknowledgement"),
            Err(_) => debug!("deregistration acknowledgement timed out"),
        }
    }

    /// Send, logging failures at the level that drops the session.
    async fn send(&self, writer: &FrameWriter, message: &Message) -> bool {
        let body = match proto::encode_body(message) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "message encode failed");
                return false;
            }
        };
        if let Err(e) = writer.write_frame(&body).await {
            info!(error = %e, "LBN write failed");
            return false;
        }
        true
    }

    /// Send where failure changes nothing — the session is ending anyway.
    async fn best_effort_send(&self, writer: &FrameWriter, message: &Message) -> bool {
        let Ok(body) = proto::encode_body(message) else {
            return false;
        };
        match writer.write_frame(&body).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "send during teardown failed");
                false
            }
        }
    }

    /// Final protocol-violation response. `id` echoes the offending
    /// request when one decoded; otherwise the sentinel id is used.
    async fn send_violation(&self, writer: &FrameWriter, id: Option<u32>) {
        let reply = MessageBuilder::protocol_violation_response(id);
        self.best_effort_send(writer, &reply).await;
    }
}

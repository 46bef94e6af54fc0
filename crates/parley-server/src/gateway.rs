//! Live-connection gateway.
//!
//! Each connection moves through `Connecting -> Authenticated -> Open ->
//! Closed`. The credential travels as the `token` query parameter because
//! browsers cannot set headers on a WebSocket handshake. A failed or slow
//! handshake is refused before upgrade and never touches the registry.
//!
//! Once open, a connection is served by its own task that drains the
//! outbound queue into the socket. Whatever ends the task (client close,
//! transport error, server close signal) it always deregisters on the way
//! out.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::ClientEvent;
use parley_shared::UserId;

use crate::api::AppState;
use crate::auth::SharedAuthenticator;
use crate::config::ServerConfig;
use crate::error::{AuthError, ServerError};
use crate::presence::{ConnectionEndpoint, ConnectionId, LiveConnection, PresenceRegistry};

/// A single socket write may not take longer than this.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Authenticated,
    Open,
    Closed,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    token: Option<String>,
}

/// Releases its slot in the global connection count on drop.
pub struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ConnectionGateway {
    presence: PresenceRegistry,
    auth: SharedAuthenticator,
    handshake_timeout: Duration,
    outbound_queue: usize,
    ping_interval: Duration,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl ConnectionGateway {
    pub fn new(
        presence: PresenceRegistry,
        auth: SharedAuthenticator,
        config: &ServerConfig,
    ) -> Self {
        Self {
            presence,
            auth,
            handshake_timeout: config.handshake_timeout,
            outbound_queue: config.outbound_queue,
            ping_interval: config.ping_interval,
            max_connections: config.max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of connections currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Reserve room for one more connection, or `None` at the cap.
    pub fn try_acquire_slot(&self) -> Option<ConnectionSlot> {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if self.max_connections > 0 && previous >= self.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ConnectionSlot(self.active.clone()))
    }

    /// Resolve the handshake credential within the configured bound.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<UserId, AuthError> {
        debug!(state = ?ConnectionState::Connecting, "Handshake received");

        let user = tokio::time::timeout(self.handshake_timeout, self.auth.resolve(credential))
            .await
            .map_err(|_| AuthError::Timeout)??;

        debug!(state = ?ConnectionState::Authenticated, user = %user, "Handshake authenticated");
        Ok(user)
    }

    /// Serve one authenticated connection until it closes.
    pub async fn serve<W, R, E>(&self, user: UserId, mut sink: W, mut stream: R)
    where
        W: Sink<WsMessage> + Unpin,
        W::Error: Display,
        R: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: Display,
    {
        let (conn, endpoint) = LiveConnection::new(user.clone(), self.outbound_queue);
        let conn_id = conn.id;
        let connected_since = conn.connected_since;
        let ConnectionEndpoint { mut events, close } = endpoint;

        // The broadcast includes this connection, which doubles as its
        // initial snapshot.
        let registration = self.presence.register(conn).await;
        if let Some(old) = &registration.displaced {
            debug!(
                user = %user,
                old_connection = %old.id,
                since = %old.connected_since,
                "Displaced earlier connection"
            );
        }
        let notified = registration.broadcast.target_count();
        registration.broadcast.dispatch();
        debug!(
            state = ?ConnectionState::Open,
            user = %user,
            connection = %conn_id,
            notified,
            "Connection open"
        );

        let start = tokio::time::Instant::now() + self.ping_interval;
        let mut ping = tokio::time::interval_at(start, self.ping_interval);

        let reason = loop {
            tokio::select! {
                _ = close.requested() => break "closed by server",

                event = events.recv() => {
                    let Some(event) = event else {
                        break "outbound queue closed";
                    };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "Failed to encode server event");
                            continue;
                        }
                    };
                    if let Err(reason) = send_frame(&mut sink, WsMessage::Text(json)).await {
                        break reason;
                    }
                }

                _ = ping.tick() => {
                    if let Err(reason) = send_frame(&mut sink, WsMessage::Ping(Vec::new())).await {
                        break reason;
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_client_frame(&user, conn_id, &text).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by client",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(user = %user, error = %e, "Transport error");
                        break "transport error";
                    }
                },
            }
        };

        // Best effort; the peer may already be gone.
        let _ = send_frame(&mut sink, WsMessage::Close(None)).await;

        if let Some(broadcast) = self.presence.deregister_connection(&user, conn_id).await {
            broadcast.dispatch();
        }

        let connected_secs = (chrono::Utc::now() - connected_since).num_seconds();
        info!(
            state = ?ConnectionState::Closed,
            user = %user,
            connection = %conn_id,
            reason,
            connected_secs,
            "Connection closed"
        );
    }

    async fn handle_client_frame(&self, user: &UserId, conn_id: ConnectionId, text: &str) {
        match ClientEvent::from_json(text) {
            Some(ClientEvent::Viewing { peer }) => {
                debug!(
                    user = %user,
                    peer = ?peer.as_ref().map(|p| p.as_str()),
                    "Viewing context changed"
                );
                self.presence.set_viewing(user, conn_id, peer).await;
            }
            None => debug!(user = %user, "Ignoring unrecognised client frame"),
        }
    }
}

async fn send_frame<W>(sink: &mut W, frame: WsMessage) -> Result<(), &'static str>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Socket write failed");
            Err("write failed")
        }
        Err(_) => Err("write timed out"),
    }
}

/// `GET /ws?token=...`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
) -> Result<Response, ServerError> {
    let gateway = state.gateway.clone();

    let Some(slot) = gateway.try_acquire_slot() else {
        error!(
            active = gateway.active(),
            max = gateway.max_connections,
            "Live connection limit reached, refusing handshake"
        );
        return Err(ServerError::Unavailable(
            "too many live connections".to_string(),
        ));
    };

    let user = match gateway.authenticate(query.token.as_deref()).await {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "Live connection handshake rejected");
            return Err(ServerError::Unauthenticated(e));
        }
    };

    Ok(ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        let (sink, stream) = socket.split();
        gateway.serve(user, sink, stream).await;
    }))
}

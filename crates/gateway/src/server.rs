//! Client-facing WebSocket server.
//!
//! Each upgraded connection runs one [`GatewaySession`] against the shared
//! [`WorkerLink`], with separate read and write pump tasks.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use proto::{ClientFrame, ErrorKind, GatewayError, SessionId};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::WorkerLink;
use crate::session::GatewaySession;

const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Query parameters for the WebSocket upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Authentication token (`?token=xxx`).
    pub token: Option<String>,
}

/// Live client connections, keyed by their local connection id
#[derive(Debug, Default)]
pub struct ConnectionGroup {
    connections: DashMap<SessionId, DateTime<Utc>>,
}

impl ConnectionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection; it is removed when the returned guard drops.
    pub fn join(self: &Arc<Self>) -> ConnectionGuard {
        let id = SessionId::new();
        self.connections.insert(id.clone(), Utc::now());
        ConnectionGuard {
            id,
            group: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// When the connection joined, if it is still live.
    pub fn connected_at(&self, id: &SessionId) -> Option<DateTime<Utc>> {
        self.connections.get(id).map(|entry| *entry.value())
    }
}

/// Membership of one connection in a [`ConnectionGroup`]
pub struct ConnectionGuard {
    id: SessionId,
    group: Arc<ConnectionGroup>,
}

impl ConnectionGuard {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.group.connections.remove(&self.id);
    }
}

struct GatewayState {
    link: WorkerLink,
    token: String,
    connections: Arc<ConnectionGroup>,
}

/// axum server exposing `/ws` and `/health`
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// An empty `token` disables authentication.
    pub fn new(link: WorkerLink, token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(GatewayState {
                link,
                token: token.into(),
                connections: Arc::new(ConnectionGroup::new()),
            }),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionGroup> {
        self.state.connections.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }

    /// Serves until `shutdown` resolves, then closes the worker link.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Gateway listening on {addr}");
        }
        let app = self.router();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::Connection(format!("server error: {e}")));
        self.state.link.close();
        info!("Gateway stopped");
        result
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let authorized = validate_token(params.token.as_deref().unwrap_or(""), &state.token);
    if !authorized {
        warn!("Rejected WebSocket upgrade with invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: ws::WebSocket, state: Arc<GatewayState>) {
    let membership = state.connections.join();
    let connection_id = membership.id().clone();
    info!(connection_id = %connection_id, "WebSocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(CLIENT_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(CLIENT_CHANNEL_CAPACITY);

    let read_id = connection_id.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                ws::Message::Text(text) => {
                    if in_tx.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                ws::Message::Close(_) => break,
                _ => debug!(connection_id = %read_id, "Ignoring non-text frame"),
            }
        }
    });

    let write_id = connection_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %write_id, "Failed to encode client frame: {e}");
                    continue;
                }
            };
            if ws_tx.send(ws::Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut session = GatewaySession::new();
    match session.connect(&state.link) {
        Ok(()) => {
            if let Err(e) = session.run(in_rx, out_tx).await {
                debug!(connection_id = %connection_id, "Session ended: {e}");
            }
        }
        Err(e) => {
            let _ = out_tx
                .send(ClientFrame::error(ErrorKind::ChannelClosed, e.to_string()))
                .await;
            drop(out_tx);
        }
    }

    // The write pump flushes what the session queued, then closes the socket.
    let _ = write_task.await;
    read_task.abort();
    let connected_secs = state
        .connections
        .connected_at(&connection_id)
        .map(|at| (Utc::now() - at).num_seconds())
        .unwrap_or_default();
    drop(membership);
    info!(
        connection_id = %connection_id,
        connected_secs,
        "WebSocket client disconnected"
    );
}

/// Token comparison for authentication.
fn validate_token(given: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    given == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_expected_token_allows_everyone() {
        assert!(validate_token("", ""));
        assert!(validate_token("anything", ""));
    }

    #[test]
    fn token_must_match_exactly() {
        assert!(validate_token("s3cret", "s3cret"));
        assert!(!validate_token("", "s3cret"));
        assert!(!validate_token("S3CRET", "s3cret"));
    }

    #[test]
    fn connection_guard_leaves_group_on_drop() {
        let group = Arc::new(ConnectionGroup::new());
        let first = group.join();
        let second = group.join();
        assert_eq!(group.len(), 2);
        assert!(group.connected_at(first.id()).is_some());

        drop(first);
        assert_eq!(group.len(), 1);
        assert!(group.connected_at(second.id()).is_some());
        drop(second);
        assert!(group.is_empty());
    }
}

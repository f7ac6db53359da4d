//! Per-client gateway session.

use std::collections::HashSet;

use proto::{
    ClientCommand, ClientFrame, CommandEnvelope, CommandId, ErrorKind, GatewayError,
    ResponseMessage, RoutedMessage, SessionId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{SessionEndpoint, WorkerLink};

/// Lifecycle of a [`GatewaySession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a worker endpoint.
    Connecting,
    /// Relaying between client and worker.
    Active,
    /// Releasing the worker endpoint.
    Closing,
    /// Finished; the endpoint is released.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

enum Event {
    Client(Option<String>),
    Worker(Option<RoutedMessage>),
}

/// Validates client messages, forwards them to the worker and relays responses back
pub struct GatewaySession {
    state: SessionState,
    endpoint: Option<SessionEndpoint>,
}

impl GatewaySession {
    /// Creates a session in [`SessionState::Connecting`].
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            endpoint: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session id on the worker link, once connected.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.endpoint.as_ref().map(SessionEndpoint::session_id)
    }

    /// Opens an endpoint on `link`. Failure moves straight to `Closed`.
    pub fn connect(&mut self, link: &WorkerLink) -> Result<(), GatewayError> {
        if self.state != SessionState::Connecting {
            return Err(GatewayError::SessionClosed(format!(
                "cannot connect a session that is {}",
                self.state
            )));
        }
        match link.open_endpoint() {
            Ok(endpoint) => {
                info!(session_id = %endpoint.session_id(), "Session active");
                self.endpoint = Some(endpoint);
                self.state = SessionState::Active;
                Ok(())
            }
            Err(e) => {
                warn!("Session failed to connect: {e}");
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Relays until the client disconnects or the worker link closes.
    ///
    /// `client_rx` yields raw client text frames; `client_tx` takes frames for
    /// the client. The endpoint is released on every exit path, after a STOP
    /// for every stream that started but has not ended.
    pub async fn run(
        &mut self,
        mut client_rx: mpsc::Receiver<String>,
        client_tx: mpsc::Sender<ClientFrame>,
    ) -> Result<(), GatewayError> {
        let Some(mut endpoint) = self.endpoint.take() else {
            self.state = SessionState::Closed;
            return Err(GatewayError::SessionClosed(format!(
                "session is {}, not active",
                self.state
            )));
        };
        let session_id = endpoint.session_id().clone();
        let mut open_streams: HashSet<CommandId> = HashSet::new();

        let result = loop {
            let event = tokio::select! {
                text = client_rx.recv() => Event::Client(text),
                routed = endpoint.recv() => Event::Worker(routed),
            };

            match event {
                Event::Client(Some(text)) => {
                    let envelope =
                        match ClientCommand::parse(&text).and_then(ClientCommand::into_envelope) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                debug!(session_id = %session_id, "Rejected client message: {e}");
                                if client_tx.send(ClientFrame::from(e)).await.is_err() {
                                    break Ok(());
                                }
                                continue;
                            }
                        };
                    if let Err(e) = endpoint.send(&envelope).await {
                        let _ = client_tx
                            .send(ClientFrame::error(ErrorKind::ChannelClosed, e.to_string()))
                            .await;
                        break Err(e);
                    }
                }
                Event::Client(None) => {
                    debug!(session_id = %session_id, "Client disconnected");
                    break Ok(());
                }
                Event::Worker(Some(routed)) => {
                    let frame = match routed.decode_response() {
                        Ok(response) => {
                            track_stream(&mut open_streams, routed.command_id.as_ref(), &response);
                            ClientFrame::from_response(routed.command_id, response)
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, "Undecodable worker response: {e}");
                            ClientFrame::error(ErrorKind::Internal, e.to_string())
                        }
                    };
                    if client_tx.send(frame).await.is_err() {
                        debug!(session_id = %session_id, "Client writer gone");
                        break Ok(());
                    }
                }
                Event::Worker(None) => {
                    let reason = if endpoint.link_closed() {
                        "worker link closed"
                    } else {
                        "session fell behind; responses dropped"
                    };
                    warn!(session_id = %session_id, "{reason}");
                    let _ = client_tx
                        .send(ClientFrame::error(ErrorKind::ChannelClosed, reason))
                        .await;
                    break Err(GatewayError::SessionClosed(reason.to_string()));
                }
            }
        };

        self.state = SessionState::Closing;
        for command_id in open_streams {
            debug!(session_id = %session_id, command_id = %command_id, "Stopping orphaned stream");
            if let Err(e) = endpoint.send(&CommandEnvelope::stop(command_id)).await {
                debug!(session_id = %session_id, "Could not stop stream: {e}");
                break;
            }
        }
        drop(endpoint);
        self.state = SessionState::Closed;
        info!(session_id = %session_id, "Session closed");
        result
    }
}

/// Keeps the set of streams between their `StreamStart` and `StreamEnd`.
fn track_stream(
    open: &mut HashSet<CommandId>,
    command_id: Option<&CommandId>,
    response: &ResponseMessage,
) {
    let Some(command_id) = command_id else {
        return;
    };
    match response {
        ResponseMessage::StreamStart => {
            open.insert(command_id.clone());
        }
        ResponseMessage::StreamEnd => {
            open.remove(command_id);
        }
        _ => {}
    }
}

impl Default for GatewaySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proto::{CommandEnvelope, CommandType, ResponseMessage, read_message, write_message};

    use super::*;

    async fn next_frame(rx: &mut mpsc::Receiver<ClientFrame>) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame before timeout")
            .expect("frame")
    }

    #[tokio::test]
    async fn connect_failure_goes_straight_to_closed() {
        let (gateway_side, _worker_side) = tokio::io::duplex(1024);
        let link = WorkerLink::from_stream(gateway_side);
        link.close();

        let mut session = GatewaySession::new();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.connect(&link).is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn run_without_connect_is_rejected() {
        let mut session = GatewaySession::new();
        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        assert!(session.run(in_rx, out_tx).await.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn invalid_messages_get_error_frames_and_valid_ones_are_forwarded() {
        let (gateway_side, mut worker_side) = tokio::io::duplex(4096);
        let link = WorkerLink::from_stream(gateway_side);
        let mut session = GatewaySession::new();
        session.connect(&link).expect("connect");
        assert_eq!(session.state(), SessionState::Active);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let running = tokio::spawn(async move {
            let result = session.run(in_rx, out_tx).await;
            (session, result)
        });

        in_tx.send("{not json".to_string()).await.expect("send");
        match next_frame(&mut out_rx).await {
            ClientFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::MalformedEnvelope),
            other => panic!("unexpected frame: {other:?}"),
        }

        in_tx
            .send(r#"{"command_type":"shutdown","body":""}"#.to_string())
            .await
            .expect("send");
        match next_frame(&mut out_rx).await {
            ClientFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::UnknownCommandType),
            other => panic!("unexpected frame: {other:?}"),
        }

        in_tx
            .send(r#"{"command_type":"math","body":"2 * 21"}"#.to_string())
            .await
            .expect("send");
        let request = read_message(&mut worker_side)
            .await
            .expect("read")
            .expect("frame");
        let envelope = CommandEnvelope::decode(&request.message).expect("envelope");
        assert_eq!(envelope.command_type, CommandType::Math);

        write_message(
            &mut worker_side,
            &RoutedMessage::response(
                request.session_id,
                None,
                &ResponseMessage::Result { value: 42.0 },
            ),
        )
        .await
        .expect("reply");
        assert_eq!(
            next_frame(&mut out_rx).await,
            ClientFrame::Result {
                command_id: None,
                result: serde_json::Value::from(42)
            }
        );

        drop(in_tx);
        let (session, result) = running.await.expect("session task");
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(link.session_count(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_stops_streams_still_running() {
        let (gateway_side, mut worker_side) = tokio::io::duplex(4096);
        let link = WorkerLink::from_stream(gateway_side);
        let mut session = GatewaySession::new();
        session.connect(&link).expect("connect");
        let session_id = session.session_id().cloned().expect("session id");

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let running = tokio::spawn(async move { session.run(in_rx, out_tx).await });

        for (id, response) in [
            ("finished", ResponseMessage::StreamStart),
            ("running", ResponseMessage::StreamStart),
            ("finished", ResponseMessage::StreamEnd),
        ] {
            let frame =
                RoutedMessage::response(session_id.clone(), Some(CommandId::from(id)), &response);
            write_message(&mut worker_side, &frame).await.expect("write");
            next_frame(&mut out_rx).await;
        }

        drop(in_tx);
        running.await.expect("session task").expect("clean exit");

        let request = tokio::time::timeout(Duration::from_secs(5), read_message(&mut worker_side))
            .await
            .expect("stop before timeout")
            .expect("read")
            .expect("frame");
        let envelope = CommandEnvelope::decode(&request.message).expect("envelope");
        assert_eq!(envelope.command_type, CommandType::Stop);
        assert_eq!(envelope.command_id, Some(CommandId::from("running")));
        assert_eq!(link.session_count(), 0);
    }

    #[test]
    fn tracking_ignores_frames_without_a_stream_boundary() {
        let mut open = HashSet::new();
        let id = CommandId::from("c");
        track_stream(&mut open, None, &ResponseMessage::StreamStart);
        track_stream(&mut open, Some(&id), &ResponseMessage::Output { line: "x".to_string() });
        assert!(open.is_empty());
        track_stream(&mut open, Some(&id), &ResponseMessage::StreamStart);
        assert!(open.contains(&id));
        track_stream(&mut open, Some(&id), &ResponseMessage::StreamEnd);
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn worker_hangup_sends_channel_closed_and_ends_session() {
        let (gateway_side, worker_side) = tokio::io::duplex(1024);
        let link = WorkerLink::from_stream(gateway_side);
        let mut session = GatewaySession::new();
        session.connect(&link).expect("connect");

        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        drop(worker_side);

        let result = session.run(in_rx, out_tx).await;
        assert!(matches!(result, Err(GatewayError::SessionClosed(_))));
        assert_eq!(session.state(), SessionState::Closed);
        match next_frame(&mut out_rx).await {
            ClientFrame::Error { kind, error } => {
                assert_eq!(kind, ErrorKind::ChannelClosed);
                assert_eq!(error, "worker link closed");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

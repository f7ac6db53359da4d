//! Worker dispatch loop.
//!
//! One loop serves one gateway connection. Envelopes are handled in arrival
//! order; each OS command then streams from its own task in a [`JoinSet`] so
//! long-running output never blocks the next envelope.

use std::sync::Arc;

use proto::{
    CommandEnvelope, CommandId, CommandType, ErrorKind, ResponseMessage, RoutedMessage, SessionId,
    TransportError, WorkerError, read_message, write_message,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::executor::{CommandStream, StreamingExecutor};
use crate::math;
use crate::registry::ProcessRegistry;

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

/// Routes envelopes to the executor, evaluator and registry
pub struct Dispatcher {
    executor: StreamingExecutor,
    audit: Arc<dyn AuditSink>,
}

impl Dispatcher {
    /// Creates a dispatcher over injected collaborators.
    pub fn new(executor: StreamingExecutor, audit: Arc<dyn AuditSink>) -> Self {
        Self { executor, audit }
    }

    /// Registry of processes started by this dispatcher.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        self.executor.registry()
    }

    /// Serves one connection until the peer closes, the link fails or `shutdown` fires.
    ///
    /// In-flight streams are aborted when the loop exits, which kills their
    /// process groups.
    pub async fn serve<S>(
        &self,
        stream: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (out_tx, mut out_rx) = mpsc::channel::<RoutedMessage>(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Err(e) = write_message(&mut writer, &message).await else {
                    continue;
                };
                if !e.is_message_rejected() {
                    warn!("Failed to write response frame: {e}");
                    break;
                }
                // Nothing reached the stream, so the session still gets a reply.
                warn!(session_id = %message.session_id, "Dropping unwritable response: {e}");
                let notice = RoutedMessage::response(
                    message.session_id,
                    message.command_id,
                    &ResponseMessage::error(ErrorKind::Internal, format!("response dropped: {e}")),
                );
                if let Err(e) = write_message(&mut writer, &notice).await {
                    warn!("Failed to write response frame: {e}");
                    break;
                }
            }
        });

        // Frame reads are not cancel-safe, so they live in their own task.
        let (in_tx, mut in_rx) =
            mpsc::channel::<Result<RoutedMessage, TransportError>>(INBOUND_CAPACITY);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if in_tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(TransportError::InvalidFrame(reason)) => {
                        warn!("Dropping undecodable frame: {reason}");
                    }
                    Err(e) => {
                        let _ = in_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut streams = JoinSet::new();
        let result = if *shutdown.borrow() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Dispatcher shutting down");
                            break Ok(());
                        }
                    }
                    Some(joined) = streams.join_next(), if !streams.is_empty() => {
                        if let Err(e) = joined
                            && !e.is_cancelled()
                        {
                            warn!("Stream task failed: {e}");
                        }
                    }
                    _ = out_tx.closed() => {
                        warn!("Response writer stopped");
                        break Err(TransportError::Closed);
                    }
                    inbound = in_rx.recv() => match inbound {
                        Some(Ok(message)) => self.dispatch(message, &out_tx, &mut streams).await,
                        Some(Err(e)) => break Err(e),
                        None => {
                            debug!("Gateway closed the connection");
                            break Ok(());
                        }
                    },
                }
            }
        };

        streams.shutdown().await;
        reader_task.abort();
        drop(out_tx);
        if let Err(e) = writer_task.await {
            warn!("Writer task failed: {e}");
        }
        result
    }

    /// Handles one routed envelope. Failures become responses; nothing here ends the loop.
    async fn dispatch(
        &self,
        routed: RoutedMessage,
        out: &mpsc::Sender<RoutedMessage>,
        streams: &mut JoinSet<()>,
    ) {
        self.audit.record(&routed.message);
        let session_id = routed.session_id;

        let envelope = match CommandEnvelope::decode(&routed.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %session_id, "Rejected envelope: {e}");
                let response = ResponseMessage::error(e.kind(), e.to_string());
                emit(out, &session_id, routed.command_id, response).await;
                return;
            }
        };

        match envelope.command_type {
            CommandType::Math => {
                let command_id = envelope.command_id.clone().unwrap_or_default();
                let response = self.handle_math(&envelope);
                emit(out, &session_id, Some(command_id), response).await;
            }
            CommandType::Stop => {
                let response = self.handle_stop(envelope.command_id.as_ref());
                emit(out, &session_id, envelope.command_id, response).await;
            }
            CommandType::Os => self.start_stream(session_id, envelope, out, streams).await,
        }
    }

    /// Evaluates an arithmetic envelope.
    pub fn handle_math(&self, envelope: &CommandEnvelope) -> ResponseMessage {
        match math::evaluate_with(&envelope.body, &envelope.parameters) {
            Ok(value) => ResponseMessage::Result { value },
            Err(e) => {
                debug!(expression = %envelope.joined_body(), "Evaluation failed: {e}");
                ResponseMessage::error(ErrorKind::EvaluationError, e.to_string())
            }
        }
    }

    /// Terminates the process registered under `command_id`.
    pub fn handle_stop(&self, command_id: Option<&CommandId>) -> ResponseMessage {
        let Some(command_id) = command_id else {
            return ResponseMessage::error(
                ErrorKind::MalformedEnvelope,
                "Command ID is required to stop a process.",
            );
        };

        match self.registry().stop(command_id) {
            Ok(_) => ResponseMessage::Status {
                success: true,
                message: format!("Subprocess {command_id} stopped."),
            },
            Err(e @ WorkerError::ProcessNotFound(_)) => ResponseMessage::Status {
                success: false,
                message: e.to_string(),
            },
            Err(e) => {
                warn!(command_id = %command_id, "STOP failed: {e}");
                ResponseMessage::error(e.kind(), e.to_string())
            }
        }
    }

    /// Spawns an OS command and hands its output to a stream task.
    async fn start_stream(
        &self,
        session_id: SessionId,
        envelope: CommandEnvelope,
        out: &mpsc::Sender<RoutedMessage>,
        streams: &mut JoinSet<()>,
    ) {
        let command_id = envelope.command_id.clone().unwrap_or_default();
        let command = envelope.joined_body();

        let stream = match self.executor.spawn(command_id.clone(), &command) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(command_id = %command_id, "Failed to start command: {e}");
                let response = ResponseMessage::error(e.kind(), e.to_string());
                emit(out, &session_id, Some(command_id), response).await;
                return;
            }
        };
        info!(
            session_id = %session_id,
            command_id = %command_id,
            pid = stream.pid(),
            "Command started"
        );

        if !emit(out, &session_id, Some(command_id), ResponseMessage::StreamStart).await {
            return;
        }
        streams.spawn(relay_stream(stream, session_id, out.clone()));
    }
}

/// Relays stdout lines, then closes the stream with exactly one `StreamEnd`.
async fn relay_stream(
    mut stream: CommandStream,
    session_id: SessionId,
    out: mpsc::Sender<RoutedMessage>,
) {
    let command_id = stream.command_id().clone();

    while let Some(line) = stream.next_line().await {
        let response = ResponseMessage::Output { line };
        if !emit(&out, &session_id, Some(command_id.clone()), response).await {
            // Nobody is listening; dropping the stream kills the process group.
            return;
        }
    }

    match stream.finish().await {
        Ok(status) => info!(command_id = %command_id, %status, "Command finished"),
        Err(e) => warn!(command_id = %command_id, "Failed to reap command: {e}"),
    }
    emit(&out, &session_id, Some(command_id), ResponseMessage::StreamEnd).await;
}

/// Queues a response for the writer. Returns `false` once the connection is gone.
async fn emit(
    out: &mpsc::Sender<RoutedMessage>,
    session_id: &SessionId,
    command_id: Option<CommandId>,
    response: ResponseMessage,
) -> bool {
    let routed = RoutedMessage::response(session_id.clone(), command_id, &response);
    if out.send(routed).await.is_err() {
        debug!(session_id = %session_id, "Connection closed, dropping response");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAudit;

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(ProcessRegistry::new());
        Dispatcher::new(StreamingExecutor::new(registry), Arc::new(NoopAudit))
    }

    #[test]
    fn math_returns_result_or_evaluation_error() {
        let d = dispatcher();
        let ok = d.handle_math(&CommandEnvelope::math("2 + 3 *", vec!["4".to_string()]));
        assert_eq!(ok, ResponseMessage::Result { value: 14.0 });

        let err = d.handle_math(&CommandEnvelope::math("10 / 0", Vec::new()));
        assert_eq!(
            err,
            ResponseMessage::error(ErrorKind::EvaluationError, "division by zero")
        );
    }

    #[test]
    fn stop_without_id_is_malformed() {
        let d = dispatcher();
        match d.handle_stop(None) {
            ResponseMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::MalformedEnvelope),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn stop_of_unknown_id_is_a_failed_status() {
        let d = dispatcher();
        assert_eq!(
            d.handle_stop(Some(&CommandId::from("abc123"))),
            ResponseMessage::Status {
                success: false,
                message: "Subprocess abc123 not found.".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_of_running_command_succeeds_and_evicts() {
        let d = dispatcher();
        let id = CommandId::from("sleeper");
        let _stream = d.executor.spawn(id.clone(), "sleep 30").expect("spawn");

        assert_eq!(
            d.handle_stop(Some(&id)),
            ResponseMessage::Status {
                success: true,
                message: "Subprocess sleeper stopped.".to_string()
            }
        );
        assert!(d.registry().get(&id).is_none());
    }

    #[tokio::test]
    async fn serve_returns_when_shutdown_already_signalled() {
        let d = dispatcher();
        let (_client, server) = tokio::io::duplex(1024);
        let (_tx, rx) = watch::channel(true);
        d.serve(server, rx).await.expect("serve");
    }
}

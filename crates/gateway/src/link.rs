//! Shared connection from the gateway to the worker.
//!
//! One TCP connection carries every session. A writer task serializes
//! outbound frames; a reader task hands inbound frames to [`SessionRouter`].

use std::sync::Arc;

use proto::{
    CommandEnvelope, ErrorKind, GatewayError, ResponseMessage, RoutedMessage, SessionId,
    TransportError, read_message, write_message,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::router::SessionRouter;

const OUTBOUND_CAPACITY: usize = 256;
const ENDPOINT_CAPACITY: usize = 4096;

/// Multiplexed link to the worker
#[derive(Clone)]
pub struct WorkerLink {
    router: Arc<SessionRouter>,
    outbound: mpsc::Sender<RoutedMessage>,
    closed: Arc<watch::Sender<bool>>,
    reader: AbortHandle,
}

impl WorkerLink {
    /// Connects to a worker over TCP.
    pub async fn connect<A>(addr: A) -> Result<Self, GatewayError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| GatewayError::Connection(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }
        info!("Connected to worker at {addr}");
        Ok(Self::from_stream(stream))
    }

    /// Starts the link over any bidirectional byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let router = Arc::new(SessionRouter::new());
        let closed = Arc::new(watch::Sender::new(false));
        let (outbound, mut outbound_rx) = mpsc::channel::<RoutedMessage>(OUTBOUND_CAPACITY);

        let writer_closed = closed.clone();
        let writer_router = router.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Err(e) = write_message(&mut writer, &message).await else {
                    continue;
                };
                if !e.is_message_rejected() {
                    warn!("Worker link write failed: {e}");
                    mark_closed(&writer_closed, &writer_router);
                    break;
                }
                warn!(session_id = %message.session_id, "Dropping unwritable request: {e}");
                writer_router.route(RoutedMessage::response(
                    message.session_id,
                    message.command_id,
                    &ResponseMessage::error(
                        ErrorKind::MalformedEnvelope,
                        format!("request dropped: {e}"),
                    ),
                ));
            }
            debug!("Worker link writer stopped");
        });

        let reader_closed = closed.clone();
        let reader_router = router.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        reader_router.route(message);
                    }
                    Ok(None) => {
                        info!("Worker closed the link");
                        break;
                    }
                    Err(TransportError::InvalidFrame(reason)) => {
                        warn!("Dropping undecodable worker frame: {reason}");
                    }
                    Err(e) => {
                        warn!("Worker link read failed: {e}");
                        break;
                    }
                }
            }
            mark_closed(&reader_closed, &reader_router);
        })
        .abort_handle();

        Self {
            router,
            outbound,
            closed,
            reader,
        }
    }

    /// Opens an endpoint for a new session.
    pub fn open_endpoint(&self) -> Result<SessionEndpoint, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Connection("worker link is closed".to_string()));
        }

        let session_id = SessionId::new();
        let (tx, inbound) = mpsc::channel(ENDPOINT_CAPACITY);
        self.router.register(session_id.clone(), tx);

        // The reader may have closed the link between the check and the insert.
        if self.is_closed() {
            self.router.deregister(&session_id);
            return Err(GatewayError::Connection("worker link is closed".to_string()));
        }

        Ok(SessionEndpoint {
            session_id,
            outbound: self.outbound.clone(),
            inbound,
            router: self.router.clone(),
            link: self.closed.subscribe(),
        })
    }

    /// Returns `true` once the worker connection is gone.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves when the worker connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of sessions currently attached.
    pub fn session_count(&self) -> usize {
        self.router.session_count()
    }

    /// Tears the link down; every endpoint observes the closure.
    pub fn close(&self) {
        self.reader.abort();
        mark_closed(&self.closed, &self.router);
    }
}

fn mark_closed(closed: &watch::Sender<bool>, router: &SessionRouter) {
    closed.send_replace(true);
    router.close_all();
}

/// One session's view of the worker link
///
/// Dropping the endpoint removes its route.
pub struct SessionEndpoint {
    session_id: SessionId,
    outbound: mpsc::Sender<RoutedMessage>,
    inbound: mpsc::Receiver<RoutedMessage>,
    router: Arc<SessionRouter>,
    link: watch::Receiver<bool>,
}

impl SessionEndpoint {
    /// Identifier stamped on every frame of this session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Sends an envelope to the worker.
    pub async fn send(&self, envelope: &CommandEnvelope) -> Result<(), GatewayError> {
        let routed = RoutedMessage::request(self.session_id.clone(), envelope)?;
        self.outbound
            .send(routed)
            .await
            .map_err(|_| GatewayError::SessionClosed("worker link closed".to_string()))
    }

    /// Next worker frame for this session.
    ///
    /// `None` means the route is gone: either the link closed or this session
    /// fell too far behind and was cut off. [`SessionEndpoint::link_closed`]
    /// tells the two apart.
    pub async fn recv(&mut self) -> Option<RoutedMessage> {
        self.inbound.recv().await
    }

    /// Returns `true` once the shared worker link is gone.
    pub fn link_closed(&self) -> bool {
        *self.link.borrow()
    }
}

impl Drop for SessionEndpoint {
    fn drop(&mut self) {
        self.router.deregister(&self.session_id);
    }
}

use dashmap::DashMap;
use proto::{RoutedMessage, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Routes worker responses to the gateway session that issued the request
#[derive(Debug, Default)]
pub struct SessionRouter {
    /// session_id -> inbound sender of that session's endpoint
    sessions: DashMap<SessionId, mpsc::Sender<RoutedMessage>>,
}

impl SessionRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session endpoint
    pub fn register(&self, session_id: SessionId, tx: mpsc::Sender<RoutedMessage>) {
        debug!("Registering session: {session_id}");
        if self.sessions.insert(session_id.clone(), tx).is_some() {
            warn!("Replaced existing route for session {session_id}");
        }
    }

    /// Deregister a session endpoint
    pub fn deregister(&self, session_id: &SessionId) {
        if self.sessions.remove(session_id).is_some() {
            debug!("Deregistered session: {session_id}");
        }
    }

    /// Route a worker frame to its session. Returns `false` if nobody took it.
    ///
    /// Never waits. A session whose queue is full is cut off so it cannot stall
    /// delivery to the others; its endpoint then drains and sees the end of
    /// its stream.
    pub fn route(&self, message: RoutedMessage) -> bool {
        // Clone the sender so deregistering below does not deadlock on the map guard.
        let tx = self
            .sessions
            .get(&message.session_id)
            .map(|entry| entry.value().clone());
        let Some(tx) = tx else {
            debug!(
                session_id = %message.session_id,
                "Dropping response for departed session"
            );
            return false;
        };

        let session_id = message.session_id.clone();
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %session_id, "Session is not keeping up; dropping its route");
                self.deregister(&session_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(session_id = %session_id, "Session endpoint closed before delivery");
                self.deregister(&session_id);
                false
            }
        }
    }

    /// Drops every route so all endpoints observe a closed link
    pub fn close_all(&self) {
        self.sessions.clear();
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

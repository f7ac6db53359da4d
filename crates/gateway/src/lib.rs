//! Gateway components: worker link, session routing and the WebSocket server.

pub mod link;
pub mod router;
pub mod server;
pub mod session;

/// Shared worker connection and per-session endpoints.
pub use link::{SessionEndpoint, WorkerLink};
/// Response router keyed by session id.
pub use router::SessionRouter;
/// WebSocket server and connection bookkeeping.
pub use server::{ConnectionGroup, ConnectionGuard, GatewayServer};
/// Per-client session state machine.
pub use session::{GatewaySession, SessionState};

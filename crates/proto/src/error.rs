use thiserror::Error;

use crate::response::ErrorKind;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Gateway session/link error.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Worker execution error.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Framed transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Audit database error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Wire protocol error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Worker link could not be established or is gone.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Listener could not be bound.
    #[error("Bind error: {0}")]
    Bind(String),

    /// The session can no longer exchange messages with the worker.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Request could not be encoded for the worker.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

/// Framed transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket read/write failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer announced a frame above the size limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame payload was not a valid routed message.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The channel has been closed.
    #[error("Channel closed")]
    Closed,
}

impl TransportError {
    /// `true` when a write rejected only the message itself.
    ///
    /// Such writes fail before any byte reaches the stream, so the stream stays
    /// usable for the next frame. Read errors never qualify.
    pub fn is_message_rejected(&self) -> bool {
        matches!(
            self,
            TransportError::FrameTooLarge(_) | TransportError::InvalidFrame(_)
        )
    }
}

/// Worker execution errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Subprocess could not be started.
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    /// A live process is already registered under this command id.
    #[error("Command id {0} is already in use")]
    CommandIdInUse(String),

    /// No live process is registered under this command id.
    #[error("Subprocess {0} not found.")]
    ProcessNotFound(String),

    /// Termination signal could not be delivered.
    #[error("Failed to signal subprocess {command_id}: {reason}")]
    Signal { command_id: String, reason: String },

    /// Waiting on or reading from a subprocess failed.
    #[error("Process I/O error: {0}")]
    Io(String),

    /// Worker listener could not be bound.
    #[error("Bind error: {0}")]
    Bind(String),
}

impl WorkerError {
    /// Client-visible classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Spawn(_) => ErrorKind::SpawnFailure,
            WorkerError::CommandIdInUse(_) => ErrorKind::CommandIdInUse,
            WorkerError::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
            WorkerError::Signal { .. } | WorkerError::Io(_) | WorkerError::Bind(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Schema setup error.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload is not JSON at all.
    #[error("Invalid JSON format: {0}")]
    InvalidJson(String),

    /// Payload is JSON but violates the message schema.
    #[error("JSON validation error: {0}")]
    Validation(String),

    /// Command type is not one the worker understands.
    #[error("Invalid command type: {0}")]
    UnknownCommandType(String),

    /// Worker response text could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProtoError {
    /// Client-visible classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtoError::UnknownCommandType(_) => ErrorKind::UnknownCommandType,
            ProtoError::InvalidResponse(_) | ProtoError::Serialization(_) => ErrorKind::Internal,
            ProtoError::InvalidJson(_) | ProtoError::Validation(_) => ErrorKind::MalformedEnvelope,
        }
    }
}

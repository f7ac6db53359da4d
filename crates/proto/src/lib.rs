//! Shared protocol types for the gateway and the worker.
//!
//! This crate defines the client protocol, the command envelope and response
//! encodings used on the worker link, the length-prefixed frame codec, and the
//! strongly-typed error enums shared across the workspace.

pub mod client;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod id;
pub mod response;
pub mod routed;

/// Re-export of client protocol types.
pub use client::{ClientCommand, ClientFrame, MAX_CLIENT_MESSAGE_LEN, MAX_COMMAND_TYPE_LEN};
/// Re-export of frame codec helpers.
pub use codec::{MAX_FRAME_LEN, read_frame, read_message, write_frame, write_message};
/// Re-export of envelope types.
pub use envelope::{CommandEnvelope, CommandType, MATH_PREFIX, STOP_COMMAND, WireEnvelope};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of identity types.
pub use id::{CommandId, SessionId};
/// Re-export of worker response types.
pub use response::{ERROR_PREFIX, ErrorKind, ResponseMessage, STREAM_END, STREAM_START, number_value};
/// Re-export of the routed frame header.
pub use routed::RoutedMessage;

//! Multiplexing header for the shared gateway↔worker link.

use serde::{Deserialize, Serialize};

use crate::envelope::CommandEnvelope;
use crate::error::ProtoError;
use crate::id::{CommandId, SessionId};
use crate::response::ResponseMessage;

/// One frame on the worker link, addressed to a gateway session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Session that issued the request or must receive the response.
    pub session_id: SessionId,
    /// Command the response belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    /// Envelope JSON (inbound) or response text (outbound).
    pub message: String,
}

impl RoutedMessage {
    /// Wraps a request envelope for the worker.
    pub fn request(session_id: SessionId, envelope: &CommandEnvelope) -> Result<Self, ProtoError> {
        Ok(Self {
            session_id,
            command_id: envelope.command_id.clone(),
            message: envelope.encode()?,
        })
    }

    /// Wraps a worker response for a session.
    pub fn response(
        session_id: SessionId,
        command_id: Option<CommandId>,
        response: &ResponseMessage,
    ) -> Self {
        let message = response.to_wire(command_id.as_ref());
        Self {
            session_id,
            command_id,
            message,
        }
    }

    /// Interprets the payload as a worker response.
    pub fn decode_response(&self) -> Result<ResponseMessage, ProtoError> {
        ResponseMessage::from_wire(&self.message)
    }

    /// Serializes the frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }

    /// Parses a frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(|e| ProtoError::InvalidJson(e.to_string()))
    }
}

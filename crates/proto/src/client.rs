//! Client-facing WebSocket protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::CommandEnvelope;
use crate::error::ProtoError;
use crate::id::CommandId;
use crate::response::{ErrorKind, ResponseMessage, number_value};

/// Longest accepted `command_type` value.
pub const MAX_COMMAND_TYPE_LEN: usize = 50;

/// Largest accepted client text frame in bytes.
///
/// The envelope is escaped twice on its way into a worker frame, so this stays
/// far below [`crate::MAX_FRAME_LEN`].
pub const MAX_CLIENT_MESSAGE_LEN: usize = 128 * 1024;

const STOP_PROCESS: &str = "stop_process";
const COMMAND_ID_KEY: &str = "command_id";

/// Inbound client message. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    /// `os`, `math` or `stop_process`.
    pub command_type: String,
    /// Shell command or expression; empty for `stop_process`.
    pub body: String,
    /// Operands, or `key:value` pairs for `stop_process`.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Optional id to assign to an `os` or `math` command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl ClientCommand {
    /// Parses and validates a client text frame.
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        if text.len() > MAX_CLIENT_MESSAGE_LEN {
            return Err(ProtoError::Validation(format!(
                "message is {} bytes; the limit is {MAX_CLIENT_MESSAGE_LEN}",
                text.len()
            )));
        }
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtoError::InvalidJson(e.to_string()))?;
        let command: Self =
            serde_json::from_value(value).map_err(|e| ProtoError::Validation(e.to_string()))?;

        if command.command_type.trim().is_empty() {
            return Err(ProtoError::Validation("command_type must not be empty".to_string()));
        }
        if command.command_type.chars().count() > MAX_COMMAND_TYPE_LEN {
            return Err(ProtoError::Validation(format!(
                "command_type exceeds {MAX_COMMAND_TYPE_LEN} characters"
            )));
        }
        Ok(command)
    }

    /// Converts the validated message into a worker envelope.
    pub fn into_envelope(self) -> Result<CommandEnvelope, ProtoError> {
        let explicit_id = self
            .command_id
            .filter(|id| !id.trim().is_empty())
            .map(CommandId::from);

        let envelope = match self.command_type.trim().to_ascii_lowercase().as_str() {
            "os" => CommandEnvelope::os(self.body, self.parameters),
            "math" => CommandEnvelope::math(self.body, self.parameters),
            STOP_PROCESS => {
                let target = stop_target(&self.parameters).ok_or_else(|| {
                    ProtoError::Validation(
                        "stop_process requires a command_id:<id> parameter".to_string(),
                    )
                })?;
                return Ok(CommandEnvelope::stop(target));
            }
            _ => return Err(ProtoError::UnknownCommandType(self.command_type)),
        };

        Ok(match explicit_id {
            Some(id) => envelope.with_command_id(id),
            None => envelope,
        })
    }
}

/// Finds the `command_id:<id>` pair among `key:value` parameters.
fn stop_target(parameters: &[String]) -> Option<CommandId> {
    parameters.iter().find_map(|pair| {
        let (key, value) = pair.split_once(':')?;
        let value = value.trim();
        (key.trim() == COMMAND_ID_KEY && !value.is_empty()).then(|| CommandId::from(value))
    })
}

/// Outbound client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A command's output stream opened.
    StreamStart { command_id: Option<CommandId> },
    /// One output line.
    Output {
        command_id: Option<CommandId>,
        output: String,
    },
    /// A command's output stream closed.
    StreamEnd { command_id: Option<CommandId> },
    /// Arithmetic result.
    Result {
        command_id: Option<CommandId>,
        result: Value,
    },
    /// STOP outcome; `status` is `success` or `error`.
    Status {
        command_id: Option<CommandId>,
        status: String,
        message: String,
    },
    /// Any failure.
    Error { kind: ErrorKind, error: String },
}

impl ClientFrame {
    /// Translates a worker response into a client frame.
    pub fn from_response(command_id: Option<CommandId>, response: ResponseMessage) -> Self {
        match response {
            ResponseMessage::StreamStart => Self::StreamStart { command_id },
            ResponseMessage::Output { line } => Self::Output {
                command_id,
                output: line,
            },
            ResponseMessage::StreamEnd => Self::StreamEnd { command_id },
            ResponseMessage::Result { value } => Self::Result {
                command_id,
                result: number_value(value),
            },
            ResponseMessage::Status { success, message } => Self::Status {
                command_id,
                status: if success { "success" } else { "error" }.to_string(),
                message,
            },
            ResponseMessage::Error { kind, message } => Self::Error {
                kind,
                error: message,
            },
        }
    }

    /// Creates an error frame.
    pub fn error(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self::Error {
            kind,
            error: error.into(),
        }
    }

    /// Serializes the frame as WebSocket text.
    pub fn to_text(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }
}

impl From<ProtoError> for ClientFrame {
    fn from(err: ProtoError) -> Self {
        Self::error(err.kind(), err.to_string())
    }
}

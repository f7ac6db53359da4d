//! Command envelopes exchanged between gateway and worker.
//!
//! The worker reads a JSON object `{command, parameters?, command_id?, command_type?}`.
//! When `command_type` is absent the command text itself selects the handler:
//! a `MATH:` prefix routes to the evaluator, `STOP` routes to termination and
//! anything else runs as an OS command.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::id::CommandId;

/// Command text prefix selecting arithmetic evaluation.
pub const MATH_PREFIX: &str = "MATH:";
/// Command text selecting process termination.
pub const STOP_COMMAND: &str = "STOP";

/// Handler selected for an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Run a shell command and stream its stdout.
    Os,
    /// Evaluate an arithmetic expression.
    Math,
    /// Terminate a running command by id.
    Stop,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Os => write!(f, "os"),
            CommandType::Math => write!(f, "math"),
            CommandType::Stop => write!(f, "stop"),
        }
    }
}

impl std::str::FromStr for CommandType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "os" => Ok(CommandType::Os),
            "math" => Ok(CommandType::Math),
            "stop" => Ok(CommandType::Stop),
            _ => Err(ProtoError::UnknownCommandType(s.to_string())),
        }
    }
}

/// A classified command ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    /// Selected handler.
    pub command_type: CommandType,
    /// Shell command or expression, without routing prefix.
    pub body: String,
    /// Operands appended to `body`, space separated.
    pub parameters: Vec<String>,
    /// Client-supplied id; the worker generates one when absent.
    pub command_id: Option<CommandId>,
}

impl CommandEnvelope {
    /// Builds an OS command envelope.
    pub fn os(body: impl Into<String>, parameters: Vec<String>) -> Self {
        Self {
            command_type: CommandType::Os,
            body: body.into(),
            parameters,
            command_id: None,
        }
    }

    /// Builds an arithmetic envelope.
    pub fn math(expression: impl Into<String>, operands: Vec<String>) -> Self {
        Self {
            command_type: CommandType::Math,
            body: expression.into(),
            parameters: operands,
            command_id: None,
        }
    }

    /// Builds a termination envelope for `command_id`.
    pub fn stop(command_id: CommandId) -> Self {
        Self {
            command_type: CommandType::Stop,
            body: String::new(),
            parameters: Vec::new(),
            command_id: Some(command_id),
        }
    }

    /// Attaches an explicit command id.
    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Body followed by all parameters, joined with single spaces.
    pub fn joined_body(&self) -> String {
        std::iter::once(self.body.as_str())
            .chain(self.parameters.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    /// Converts to the worker wire shape, restoring the routing prefix.
    pub fn to_wire(&self) -> WireEnvelope {
        let command = match self.command_type {
            CommandType::Os => self.body.clone(),
            CommandType::Math => format!("{MATH_PREFIX}{}", self.body),
            CommandType::Stop => STOP_COMMAND.to_string(),
        };
        WireEnvelope {
            command: Some(command),
            parameters: self.parameters.clone(),
            command_id: self.command_id.clone(),
            command_type: Some(self.command_type.to_string()),
        }
    }

    /// Serializes to the JSON text carried in a routed frame.
    pub fn encode(&self) -> Result<String, ProtoError> {
        serde_json::to_string(&self.to_wire()).map_err(|e| ProtoError::Serialization(e.to_string()))
    }

    /// Parses and classifies JSON text received by the worker.
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| ProtoError::InvalidJson(e.to_string()))?;
        wire.classify()
    }
}

/// Envelope as it appears on the worker transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Command text, possibly carrying a routing prefix.
    #[serde(default)]
    pub command: Option<String>,
    /// Operands appended to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    /// Optional client-supplied command id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    /// Explicit handler selection; takes priority over prefix routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
}

impl WireEnvelope {
    /// Resolves the handler and strips any routing prefix from the body.
    pub fn classify(self) -> Result<CommandEnvelope, ProtoError> {
        let command = self
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProtoError::Validation("Command not provided.".to_string()))?;

        let command_type = match self.command_type.as_deref() {
            Some(explicit) => explicit.parse::<CommandType>()?,
            None if command.starts_with(MATH_PREFIX) => CommandType::Math,
            None if command.trim() == STOP_COMMAND => CommandType::Stop,
            None => CommandType::Os,
        };

        let body = match command_type {
            CommandType::Os => command,
            CommandType::Math => command
                .strip_prefix(MATH_PREFIX)
                .map(str::to_string)
                .unwrap_or(command),
            CommandType::Stop => String::new(),
        };

        Ok(CommandEnvelope {
            command_type,
            body,
            parameters: self.parameters,
            command_id: self.command_id.filter(|id| !id.as_str().is_empty()),
        })
    }
}

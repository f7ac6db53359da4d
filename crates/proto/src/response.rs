//! Worker responses and their text encoding.
//!
//! Stream boundaries travel as bare sentinels (`STREAM_START`, `STREAM_END`),
//! failures as `ERROR: <kind>: <message>`, everything else as a JSON object
//! carrying `command_id` plus one of `output`, `result` or `status`/`message`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtoError;
use crate::id::CommandId;

/// Sentinel opening a command's output stream.
pub const STREAM_START: &str = "STREAM_START";
/// Sentinel closing a command's output stream.
pub const STREAM_END: &str = "STREAM_END";
/// Prefix of error responses.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Largest magnitude at which every integer is exactly representable as `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Client-visible failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Message was not valid JSON or violated the schema.
    MalformedEnvelope,
    /// Command type not understood.
    UnknownCommandType,
    /// Subprocess could not be started.
    SpawnFailure,
    /// Command id collides with a running command.
    CommandIdInUse,
    /// Expression could not be evaluated.
    EvaluationError,
    /// STOP target is not running.
    ProcessNotFound,
    /// Transport peer is gone.
    ChannelClosed,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case tag used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::UnknownCommandType => "unknown_command_type",
            Self::SpawnFailure => "spawn_failure",
            Self::CommandIdInUse => "command_id_in_use",
            Self::EvaluationError => "evaluation_error",
            Self::ProcessNotFound => "process_not_found",
            Self::ChannelClosed => "channel_closed",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed_envelope" => Ok(Self::MalformedEnvelope),
            "unknown_command_type" => Ok(Self::UnknownCommandType),
            "spawn_failure" => Ok(Self::SpawnFailure),
            "command_id_in_use" => Ok(Self::CommandIdInUse),
            "evaluation_error" => Ok(Self::EvaluationError),
            "process_not_found" => Ok(Self::ProcessNotFound),
            "channel_closed" => Ok(Self::ChannelClosed),
            "internal" => Ok(Self::Internal),
            other => Err(ProtoError::InvalidResponse(format!(
                "unknown error kind: {other}"
            ))),
        }
    }
}

/// One message produced by the worker for a command
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    /// Output stream begins.
    StreamStart,
    /// One stdout line, trailing whitespace trimmed.
    Output { line: String },
    /// Output stream ended; emitted exactly once per stream.
    StreamEnd,
    /// Arithmetic result.
    Result { value: f64 },
    /// Outcome of a STOP.
    Status { success: bool, message: String },
    /// Handler failure.
    Error { kind: ErrorKind, message: String },
}

impl ResponseMessage {
    /// Creates an error response.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Renders the response as worker protocol text.
    pub fn to_wire(&self, command_id: Option<&CommandId>) -> String {
        match self {
            Self::StreamStart => STREAM_START.to_string(),
            Self::StreamEnd => STREAM_END.to_string(),
            Self::Error { kind, message } => format!("{ERROR_PREFIX}{kind}: {message}"),
            Self::Output { line } => json!({ "command_id": command_id, "output": line }).to_string(),
            Self::Result { value } => {
                json!({ "command_id": command_id, "result": number_value(*value) }).to_string()
            }
            Self::Status { success, message } => json!({
                "command_id": command_id,
                "status": if *success { "success" } else { "error" },
                "message": message,
            })
            .to_string(),
        }
    }

    /// Parses worker protocol text.
    pub fn from_wire(text: &str) -> Result<Self, ProtoError> {
        match text {
            STREAM_START => return Ok(Self::StreamStart),
            STREAM_END => return Ok(Self::StreamEnd),
            _ => {}
        }

        if let Some(rest) = text.strip_prefix(ERROR_PREFIX) {
            return Ok(parse_error(rest));
        }

        let payload: Payload = serde_json::from_str(text)
            .map_err(|e| ProtoError::InvalidResponse(format!("{e}: {text}")))?;

        if let Some(line) = payload.output {
            return Ok(Self::Output { line });
        }
        if let Some(result) = payload.result {
            let value = result
                .as_f64()
                .ok_or_else(|| ProtoError::InvalidResponse(format!("non-numeric result: {result}")))?;
            return Ok(Self::Result { value });
        }
        if let Some(status) = payload.status {
            return Ok(Self::Status {
                success: status == "success",
                message: payload.message.unwrap_or_default(),
            });
        }
        Err(ProtoError::InvalidResponse(format!(
            "no output, result or status field: {text}"
        )))
    }
}

/// Converts an arithmetic result to JSON, keeping exact integers integral.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn parse_error(rest: &str) -> ResponseMessage {
    if let Some((tag, message)) = rest.split_once(": ")
        && let Ok(kind) = tag.parse::<ErrorKind>()
    {
        return ResponseMessage::error(kind, message);
    }
    ResponseMessage::error(ErrorKind::Internal, rest)
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_bare_strings() {
        assert_eq!(ResponseMessage::StreamStart.to_wire(None), "STREAM_START");
        assert_eq!(ResponseMessage::StreamEnd.to_wire(None), "STREAM_END");
        assert_eq!(
            ResponseMessage::from_wire("STREAM_END").expect("parse"),
            ResponseMessage::StreamEnd
        );
    }

    #[test]
    fn output_carries_command_id_and_line() {
        let id = CommandId::from("c1");
        let text = ResponseMessage::Output {
            line: "hello".to_string(),
        }
        .to_wire(Some(&id));
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["command_id"], "c1");
        assert_eq!(value["output"], "hello");
    }

    #[test]
    fn integral_results_serialize_as_integers() {
        let text = ResponseMessage::Result { value: 14.0 }.to_wire(None);
        assert!(text.contains("\"result\":14"), "got {text}");
        assert!(!text.contains("14.0"));

        let text = ResponseMessage::Result { value: 2.5 }.to_wire(None);
        assert!(text.contains("\"result\":2.5"));
    }

    #[test]
    fn huge_results_stay_floating_point() {
        assert!(number_value(1e300).is_f64());
        assert_eq!(number_value(-3.0), Value::from(-3));
    }

    #[test]
    fn status_maps_success_flag() {
        let text = ResponseMessage::Status {
            success: false,
            message: "Subprocess abc123 not found.".to_string(),
        }
        .to_wire(Some(&CommandId::from("abc123")));
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["status"], "error");

        match ResponseMessage::from_wire(&text).expect("parse") {
            ResponseMessage::Status { success, message } => {
                assert!(!success);
                assert!(message.contains("abc123"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn error_text_keeps_kind() {
        let text = ResponseMessage::error(ErrorKind::EvaluationError, "division by zero").to_wire(None);
        assert_eq!(text, "ERROR: evaluation_error: division by zero");
        assert_eq!(
            ResponseMessage::from_wire(&text).expect("parse"),
            ResponseMessage::error(ErrorKind::EvaluationError, "division by zero")
        );
    }

    #[test]
    fn untagged_error_text_is_internal() {
        let parsed = ResponseMessage::from_wire("ERROR: something odd").expect("parse");
        assert_eq!(
            parsed,
            ResponseMessage::error(ErrorKind::Internal, "something odd")
        );
    }

    #[test]
    fn unrecognized_payload_is_rejected() {
        assert!(ResponseMessage::from_wire(r#"{"command_id":"x"}"#).is_err());
        assert!(ResponseMessage::from_wire("hello").is_err());
    }

    #[test]
    fn error_kind_parse_rejects_unknown_tags() {
        assert_eq!(
            "spawn_failure".parse::<ErrorKind>().expect("parse"),
            ErrorKind::SpawnFailure
        );
        assert!("nope".parse::<ErrorKind>().is_err());
    }
}

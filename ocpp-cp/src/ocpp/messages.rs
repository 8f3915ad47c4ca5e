//! OCPP 1.6J JSON-RPC message framing
//!
//! OCPP-J frames are JSON arrays sent over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding never panics; any malformed input yields a [`DecodeError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP 1.6 CALLERROR codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Misspelling is part of the 1.6 wire vocabulary
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    /// Parse a wire error code, mapping anything unknown to `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names used by this charge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    StartTransaction,
    StopTransaction,
    DiagnosticsStatusNotification,

    // CSMS -> CP
    GetDiagnostics,
    Reset,
    ChangeConfiguration,
    GetConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::GetDiagnostics => "GetDiagnostics",
            Action::Reset => "Reset",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::GetConfiguration => "GetConfiguration",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "DiagnosticsStatusNotification" => Ok(Action::DiagnosticsStatusNotification),
            "GetDiagnostics" => Ok(Action::GetDiagnostics),
            "Reset" => Ok(Action::Reset),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Reasons a frame could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON array")]
    NotAnArray,

    #[error("Frame is empty")]
    Empty,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(Value),

    #[error("Wrong element count for {kind:?}: got {got}")]
    Arity { kind: MessageType, got: usize },

    #[error("Missing or invalid field: {0}")]
    InvalidField(&'static str),
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("OCPP error from CSMS: {code} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for {action} response")]
    Timeout { action: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected to CSMS")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    /// Raw action name; unknown actions must still round-trip to the dispatcher
    pub action: String,
    pub payload: Value,
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

/// Parsed OCPP frame (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to OCPP wire format
    pub fn encode(&self) -> String {
        let array = match self {
            Frame::Call(c) => serde_json::json!([
                MessageType::Call as i32,
                &c.message_id,
                &c.action,
                &c.payload
            ]),
            Frame::CallResult(r) => serde_json::json!([
                MessageType::CallResult as i32,
                &r.message_id,
                &r.payload
            ]),
            Frame::CallError(e) => serde_json::json!([
                MessageType::CallError as i32,
                &e.message_id,
                e.error_code.to_string(),
                &e.error_description,
                &e.error_details
            ]),
        };
        array.to_string()
    }
}

/// Encode a CALL: `[2, messageId, action, payload]`
pub fn encode_call(message_id: &str, action: &str, payload: &Value) -> String {
    Frame::Call(Call {
        message_id: message_id.to_string(),
        action: action.to_string(),
        payload: payload.clone(),
    })
    .encode()
}

/// Encode a CALLRESULT: `[3, messageId, payload]`
pub fn encode_result(message_id: &str, payload: &Value) -> String {
    Frame::CallResult(CallResult {
        message_id: message_id.to_string(),
        payload: payload.clone(),
    })
    .encode()
}

/// Encode a CALLERROR: `[4, messageId, errorCode, errorDescription, {}]`
pub fn encode_error(message_id: &str, code: ErrorCode, description: &str) -> String {
    Frame::CallError(CallError {
        message_id: message_id.to_string(),
        error_code: code,
        error_description: description.to_string(),
        error_details: Value::Object(serde_json::Map::new()),
    })
    .encode()
}

/// Decode a frame from raw bytes
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Array(array) = value else {
        return Err(DecodeError::NotAnArray);
    };

    let tag = array.first().ok_or(DecodeError::Empty)?;
    let kind = tag
        .as_i64()
        .and_then(MessageType::from_tag)
        .ok_or_else(|| DecodeError::UnknownMessageType(tag.clone()))?;

    let arity_ok = match kind {
        MessageType::Call => array.len() == 4,
        MessageType::CallResult => array.len() == 3,
        // errorDetails is optional on the way in
        MessageType::CallError => array.len() == 4 || array.len() == 5,
    };
    if !arity_ok {
        return Err(DecodeError::Arity {
            kind,
            got: array.len(),
        });
    }

    let message_id = non_empty_str(array.get(1), "messageId")?.to_string();

    match kind {
        MessageType::Call => {
            let action = non_empty_str(array.get(2), "action")?.to_string();
            let payload = array.get(3).cloned().unwrap_or(Value::Null);
            Ok(Frame::Call(Call {
                message_id,
                action,
                payload,
            }))
        }
        MessageType::CallResult => {
            let payload = array.get(2).cloned().unwrap_or(Value::Null);
            Ok(Frame::CallResult(CallResult {
                message_id,
                payload,
            }))
        }
        MessageType::CallError => {
            let error_code = ErrorCode::from_wire(non_empty_str(array.get(2), "errorCode")?);
            let error_description = array
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let error_details = array
                .get(4)
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            Ok(Frame::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            }))
        }
    }
}

fn non_empty_str<'a>(value: Option<&'a Value>, field: &'static str) -> Result<&'a str, DecodeError> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::InvalidField(field))
}

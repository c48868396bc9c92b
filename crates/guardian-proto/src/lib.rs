//! Shared protocol definitions for the guardian extension contexts and the
//! remote signer. Kept free of runtime code so the same shapes can be mirrored
//! by the signer app and by page-side bindings.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod ids;

pub use ids::RequestIds;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message has no type")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Signing-capability operations the remote signer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "getPublicKey")]
    GetPublicKey,
    #[serde(rename = "signEvent")]
    SignEvent,
    #[serde(rename = "getRelays")]
    GetRelays,
    #[serde(rename = "nip04.encrypt")]
    Nip04Encrypt,
    #[serde(rename = "nip04.decrypt")]
    Nip04Decrypt,
    #[serde(rename = "nip44.encrypt")]
    Nip44Encrypt,
    #[serde(rename = "nip44.decrypt")]
    Nip44Decrypt,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::GetPublicKey,
        Operation::SignEvent,
        Operation::GetRelays,
        Operation::Nip04Encrypt,
        Operation::Nip04Decrypt,
        Operation::Nip44Encrypt,
        Operation::Nip44Decrypt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetPublicKey => "getPublicKey",
            Operation::SignEvent => "signEvent",
            Operation::GetRelays => "getRelays",
            Operation::Nip04Encrypt => "nip04.encrypt",
            Operation::Nip04Decrypt => "nip04.decrypt",
            Operation::Nip44Encrypt => "nip44.encrypt",
            Operation::Nip44Decrypt => "nip44.decrypt",
        }
    }

    pub fn parse(name: &str) -> Option<Operation> {
        Operation::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound frame written to the peer data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub op: Operation,
    #[serde(default)]
    pub params: Value,
}

/// Error body the remote signer attaches to `success: false` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// Inbound frame read from the peer data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

impl RpcResponse {
    /// Splits the envelope on its `success` flag. A failure without an error
    /// body still yields a [`RemoteFailure`] so callers always get a message.
    pub fn into_result(self) -> Result<Value, RemoteFailure> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| RemoteFailure::new("remote signer returned no error body")))
        }
    }
}

/// Transport-control messages exchanged between extension contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "ENSURE_OFFSCREEN")]
    EnsureOffscreen,
    #[serde(rename = "MAKE_OFFER")]
    MakeOffer {
        #[serde(default)]
        refresh: bool,
    },
    #[serde(rename = "SET_ANSWER")]
    SetAnswer {
        #[serde(rename = "answerSdp")]
        answer_sdp: String,
    },
    #[serde(rename = "CONNECTION_ESTABLISHED")]
    ConnectionEstablished,
}

impl ControlMessage {
    const TYPES: [&'static str; 4] = [
        "ENSURE_OFFSCREEN",
        "MAKE_OFFER",
        "SET_ANSWER",
        "CONNECTION_ESTABLISHED",
    ];

    pub fn is_control_type(kind: &str) -> bool {
        Self::TYPES.contains(&kind)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::EnsureOffscreen => "ENSURE_OFFSCREEN",
            ControlMessage::MakeOffer { .. } => "MAKE_OFFER",
            ControlMessage::SetAnswer { .. } => "SET_ANSWER",
            ControlMessage::ConnectionEstablished => "CONNECTION_ESTABLISHED",
        }
    }

    pub fn to_value(&self) -> Value {
        // Internally tagged enums of plain fields always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Every message kind the extension-internal bus may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeMessage {
    Control(ControlMessage),
    Operation { op: Operation, params: Value },
}

impl RuntimeMessage {
    pub fn from_value(value: &Value) -> ProtoResult<RuntimeMessage> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingType)?;
        if let Some(op) = Operation::parse(kind) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            return Ok(RuntimeMessage::Operation { op, params });
        }
        if ControlMessage::is_control_type(kind) {
            return serde_json::from_value(value.clone())
                .map(RuntimeMessage::Control)
                .map_err(|source| ProtoError::Malformed {
                    kind: kind.to_string(),
                    source,
                });
        }
        Err(ProtoError::UnknownType(kind.to_string()))
    }
}

/// Reply to `MAKE_OFFER`: the complete local description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl OfferReply {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }
}

/// Request posted by page script onto the window message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub id: String,
    pub ext: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl PageRequest {
    /// Picks tagged requests out of arbitrary window traffic. Responses share
    /// the bus, so anything carrying a `response` member is skipped.
    pub fn from_window(value: &Value, marker: &str) -> Option<PageRequest> {
        if value.get("ext").and_then(Value::as_str) != Some(marker) {
            return None;
        }
        if value.get("response").is_some_and(|response| !response.is_null()) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Settlement payload of a page-bridge call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

impl PageOutcome {
    pub fn from_result(result: Result<Value, RemoteFailure>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                success: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Response posted back onto the window message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    pub id: String,
    pub ext: String,
    pub response: PageOutcome,
}

impl PageResponse {
    pub fn from_window(value: &Value, marker: &str) -> Option<PageResponse> {
        if value.get("ext").and_then(Value::as_str) != Some(marker) {
            return None;
        }
        match value.get("response") {
            None | Some(Value::Null) => None,
            Some(_) => serde_json::from_value(value.clone()).ok(),
        }
    }
}

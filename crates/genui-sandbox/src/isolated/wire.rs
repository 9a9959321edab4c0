//! Messages crossing the boundary between host and nested context.
//!
//! Everything on the channel is plain JSON, the moral equivalent of a
//! structured clone. Both directions are decoded defensively: unknown
//! `type`s are ignored and a malformed body is reported together with the
//! sequence number it carried, if any.

use crate::capability::OPAQUE_ORIGIN;
use crate::result::{ErrorKind, Failure};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::mpsc;

/// Host to nested context: render one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Request number; strictly increasing per executor
    pub sequence: u64,
    /// Sanitized candidate source
    pub source: String,
    /// Component to render
    #[serde(rename = "componentName")]
    pub component_name: String,
}

impl RenderRequest {
    /// Wire form.
    pub fn to_value(&self) -> Value {
        json!({
            "type": "render",
            "sequence": self.sequence,
            "source": self.source,
            "componentName": self.component_name,
        })
    }
}

/// Nested context to host: outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderReply {
    /// Request this answers
    pub sequence: u64,
    /// `Ok` when the component rendered
    pub outcome: std::result::Result<(), Failure>,
}

impl RenderReply {
    /// Wire form.
    pub fn to_value(&self) -> Value {
        match &self.outcome {
            Ok(()) => json!({ "type": "result", "sequence": self.sequence, "status": "ok" }),
            Err(failure) => json!({
                "type": "result",
                "sequence": self.sequence,
                "status": "error",
                "errorKind": failure.kind.as_str(),
                "message": failure.message,
            }),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<T> {
    /// Well-formed message of the expected type
    Message(T),
    /// Expected type, unusable body
    Malformed {
        /// Sequence number, if one could be read
        sequence: Option<u64>,
        /// What was wrong
        reason: String,
    },
    /// Not addressed to this side
    Ignored,
}

fn message_type(data: &Value) -> Option<&str> {
    data.get("type").and_then(Value::as_str)
}

fn malformed<T>(data: &Value, reason: impl Into<String>) -> Inbound<T> {
    Inbound::Malformed {
        sequence: data.get("sequence").and_then(Value::as_u64),
        reason: reason.into(),
    }
}

/// Decode a message arriving at the nested context.
pub fn decode_request(data: &Value) -> Inbound<RenderRequest> {
    if message_type(data) != Some("render") {
        return Inbound::Ignored;
    }
    match serde_json::from_value::<RenderRequest>(data.clone()) {
        Ok(request) => Inbound::Message(request),
        Err(e) => malformed(data, format!("malformed render request: {e}")),
    }
}

/// Decode a message arriving at the host.
pub fn decode_reply(data: &Value) -> Inbound<RenderReply> {
    if message_type(data) != Some("result") {
        return Inbound::Ignored;
    }
    let Some(sequence) = data.get("sequence").and_then(Value::as_u64) else {
        return malformed(data, "result without a sequence number");
    };
    let outcome = match data.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        Some("error") => {
            let kind = data.get("errorKind").and_then(Value::as_str).and_then(ErrorKind::from_wire);
            let message = data.get("message").and_then(Value::as_str);
            match (kind, message) {
                (Some(kind), Some(message)) => Err(Failure::new(kind, message)),
                _ => return malformed(data, "error result without a valid errorKind and message"),
            }
        }
        _ => return malformed(data, "result with an unknown status"),
    };
    Inbound::Message(RenderReply { sequence, outcome })
}

/// Origin a posted message claims to come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A sandboxed context without `allow-same-origin`
    Opaque,
    /// Scheme, host and port, serialized
    Tuple(String),
}

impl Origin {
    /// Parse a serialized origin.
    pub fn parse(serialized: &str) -> Self {
        if serialized == OPAQUE_ORIGIN {
            Origin::Opaque
        } else {
            Origin::Tuple(serialized.to_string())
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Opaque => f.write_str(OPAQUE_ORIGIN),
            Origin::Tuple(origin) => f.write_str(origin),
        }
    }
}

/// One message as delivered to the host's inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    /// Sender's origin
    pub origin: Origin,
    /// Payload
    pub data: Value,
}

/// Sending half of the host's inbox. Cloned into every nested context.
#[derive(Debug, Clone)]
pub struct MessagePort {
    tx: mpsc::UnboundedSender<PostedMessage>,
}

impl MessagePort {
    /// A new port and the inbox it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PostedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post `data` as `origin`. Returns false once the host has gone away.
    pub fn post(&self, origin: Origin, data: Value) -> bool {
        self.tx.send(PostedMessage { origin, data }).is_ok()
    }
}

//! Janus-style signaling message types
//!
//! Pure data transforms between serde values and the wire JSON. Every
//! message carries an event/type tag under `"janus"` and, for anything
//! correlated, a caller-chosen `"transaction"` id.

use serde::Serialize;
use serde_json::Value;

/// Event tag of an acknowledgement: the real result arrives later on the
/// long-poll channel under the same transaction.
pub const EVENT_ACK: &str = "ack";

/// Benign long-poll heartbeat; never correlated to a request.
pub const EVENT_KEEPALIVE: &str = "keepalive";

/// One decoded signaling message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    /// The `"janus"` tag: `success`, `ack`, `event`, `error`, ...
    pub event_type: String,
    /// Correlation id; empty for uncorrelated events.
    pub transaction: String,
    /// The full decoded message body.
    pub body: Value,
}

/// Message decode failures (protocol-violation class).
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid signaling JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no event type tag")]
    MissingEventType,

    #[error("message is missing {0}")]
    MissingField(&'static str),
}

impl SignalingMessage {
    /// Decode a message from raw JSON text.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let body: Value = serde_json::from_str(raw)?;
        Self::from_value(body)
    }

    /// Decode a message from an already-parsed value.
    pub fn from_value(body: Value) -> Result<Self, MessageError> {
        let event_type = body
            .get("janus")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingEventType)?
            .to_string();
        let transaction = body
            .get("transaction")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            event_type,
            transaction,
            body,
        })
    }

    pub fn is_ack(&self) -> bool {
        self.event_type == EVENT_ACK
    }

    pub fn is_keepalive(&self) -> bool {
        self.event_type == EVENT_KEEPALIVE
    }

    /// `data.id` of a success response, as an opaque string.
    ///
    /// The gateway emits numeric ids for sessions and string or numeric
    /// ids for plugin handles; both address path segments, so everything
    /// is carried as text.
    pub fn data_id(&self) -> Result<String, MessageError> {
        let id = self
            .body
            .get("data")
            .and_then(|d| d.get("id"))
            .ok_or(MessageError::MissingField("data.id"))?;
        value_as_string(id).ok_or(MessageError::MissingField("data.id"))
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{"janus":"create","transaction":tx}` — open a gateway session.
#[derive(Debug, Serialize)]
pub struct CreateSessionRequest {
    pub janus: &'static str,
    pub transaction: String,
}

impl CreateSessionRequest {
    pub fn new(transaction: String) -> Self {
        Self {
            janus: "create",
            transaction,
        }
    }
}

/// `{"janus":"attach","plugin":...,"transaction":tx}` — attach a plugin
/// handle to an open session.
#[derive(Debug, Serialize)]
pub struct AttachPluginRequest {
    pub janus: &'static str,
    pub plugin: String,
    pub transaction: String,
}

impl AttachPluginRequest {
    pub fn new(transaction: String, plugin: &str) -> Self {
        Self {
            janus: "attach",
            plugin: plugin.to_string(),
            transaction,
        }
    }
}

/// Plugin-directed message: `{"janus":"message","transaction":tx,"body":...}`.
#[derive(Debug, Serialize)]
pub struct PluginRequest {
    pub janus: &'static str,
    pub transaction: String,
    pub body: Value,
}

impl PluginRequest {
    /// Create a (public) conference room.
    pub fn create_room(transaction: String) -> Self {
        Self {
            janus: "message",
            transaction,
            body: serde_json::json!({ "request": "create", "is_private": false }),
        }
    }

    /// List the participants of a room.
    pub fn list_participants(transaction: String, room: &str) -> Self {
        // Room ids are numeric on the wire when they parse as such.
        let room_value = room
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(room));
        Self {
            janus: "message",
            transaction,
            body: serde_json::json!({ "request": "listparticipants", "room": room_value }),
        }
    }
}

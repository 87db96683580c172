//! Wire types: raw frames, the outbound chat envelope, and reply decoding.
//!
//! Far ends are duck-typed: a reply may be a JSON object carrying its text
//! under `response`, `content`, or `hint` (with optional correlation id
//! echoes), or a bare string taken verbatim. Decoding normalizes both shapes
//! into [`Reply`] and never hard-fails on malformed input.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw pub/sub frame: topic plus payload text.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub payload: String,
}

impl Frame {
    /// Create a new frame.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Generate a request id: 16 lowercase hex characters.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

// ============================================================================
// Outbound Envelope
// ============================================================================

/// Outbound chat request envelope.
///
/// Serialized as camelCase JSON; optional tuning fields are omitted rather
/// than sent as null.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub request_id: String,
    pub reply_topic: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Serialize into a frame for the given topic.
    pub fn into_frame(self, topic: &str) -> Result<Frame, serde_json::Error> {
        let payload = serde_json::to_string(&self)?;
        Ok(Frame::new(topic, payload))
    }
}

// ============================================================================
// Inbound Reply
// ============================================================================

/// A decoded reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Plain text, taken verbatim from the wire.
    Text(String),
    /// A JSON object; text and correlation ids are extracted by field lookup.
    Structured(serde_json::Map<String, Value>),
}

impl Reply {
    /// Decode a raw payload.
    ///
    /// JSON objects become [`Reply::Structured`]; JSON strings unwrap to
    /// their contents; everything else (including undecodable input) is
    /// treated as verbatim text.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self::Structured(map),
            Ok(Value::String(s)) => Self::Text(s),
            _ => Self::Text(raw.to_string()),
        }
    }

    fn lookup(&self, camel: &str, snake: &str) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Structured(map) => map
                .get(camel)
                .or_else(|| map.get(snake))
                .and_then(Value::as_str),
        }
    }

    /// Request id echoed in the payload, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.lookup("requestId", "request_id")
    }

    /// Session id echoed in the payload, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.lookup("sessionId", "session_id")
    }

    /// The reply text, when one of the recognized fields carries it.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(map) => ["response", "content", "hint"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
        }
    }

    /// The reply text, falling back to the serialized object when no
    /// recognized field is present.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Structured(map) => {
                if let Some(text) = ["response", "content", "hint"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str))
                {
                    return text.to_string();
                }
                Value::Object(map).to_string()
            }
        }
    }
}

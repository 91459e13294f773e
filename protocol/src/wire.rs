use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind tag of a server-to-client chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Connected,
    Text,
    ToolUse,
    ToolResult,
    Thinking,
    Error,
    ResetComplete,
    ModelChanged,
}

/// One server-to-client frame.
///
/// A chunk with `completed = true` is terminal for the request that produced
/// it; only `text` and `error` chunks ever carry it. `reset_complete` and
/// `model_changed` are terminal for their control frames by virtue of their
/// kind alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub content: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StreamChunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            completed: false,
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>, completed: bool) -> Self {
        Self {
            kind: ChunkKind::Text,
            content: content.into(),
            completed,
            metadata: None,
        }
    }

    /// Terminal error chunk. `content` carries the stable error token.
    pub fn error(token: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Error,
            content: token.into(),
            completed: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single chat message, as archived by clients or synthesized by the
/// server on a model switch. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One client-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Natural-language prompt; the implicit frame shape `{"message": …}`.
    Prompt { message: String },
    Reset,
    ModelChange { model: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("{0}")]
    Shape(&'static str),
    #[error("unrecognized frame type {0:?}")]
    UnknownType(String),
}

/// Decode a client frame from one WebSocket text message.
///
/// Strict on `type`: anything other than the recognized tags (or its
/// absence, which means a prompt) is rejected. Unknown *fields* are
/// tolerated so older servers keep working against newer clients.
pub fn decode_client_frame(raw: &str) -> Result<ClientFrame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Json(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(DecodeError::Shape("frame must be a JSON object"));
    };

    let kind = match object.get("type") {
        None => None,
        Some(Value::String(kind)) => Some(kind.as_str()),
        Some(_) => return Err(DecodeError::Shape("frame type must be a string")),
    };

    match kind {
        None | Some("chat") => {
            let message = object
                .get("message")
                .and_then(Value::as_str)
                .ok_or(DecodeError::Shape("prompt frame requires a message field"))?;
            let message = message.trim();
            if message.is_empty() {
                return Err(DecodeError::Shape("message must not be empty"));
            }
            Ok(ClientFrame::Prompt {
                message: message.to_string(),
            })
        }
        Some("reset") => Ok(ClientFrame::Reset),
        Some("model_change") => {
            let model = object
                .get("model")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .ok_or(DecodeError::Shape("model_change requires a model field"))?;
            Ok(ClientFrame::ModelChange {
                model: model.to_string(),
            })
        }
        Some(other) => Err(DecodeError::UnknownType(other.to_string())),
    }
}

//! Vendor-facing types. The gateway only ever sees the [`LlmClient`]
//! abstraction; the wire details of a particular vendor live in its
//! implementation module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Tool definition advertised to the model, as reported by the tool server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One message in the vendor conversation.
#[derive(Debug, Clone, Serialize)]
pub struct VendorMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl VendorMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user_tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content: results,
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: blocks,
        }
    }
}

/// Content block union. Variants the vendor adds after this was written
/// deserialize as `Unknown` and are dropped with a warning instead of
/// breaking the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// One request against the vendor API.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Concrete vendor handle; already resolved, never the public id.
    pub model: String,
    pub system: String,
    pub messages: Vec<VendorMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// The vendor's answer for one request: content blocks in emission order.
#[derive(Debug, Clone)]
pub struct VendorTurn {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl VendorTurn {
    pub fn wants_tools(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
            || self
                .blocks
                .iter()
                .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<VendorTurn, TransportError>;
}

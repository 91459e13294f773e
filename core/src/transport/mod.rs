//! One live agent conversation: the vendor client plus the tool-server
//! child, owned together for the lifetime of a model selection.

pub mod anthropic;
pub mod direct;
pub mod llm;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, TransportError};
use crate::registry::ModelEntry;

/// Typed event produced while a turn is running. The stream for one turn
/// ends with exactly one of `TurnComplete` or `TurnError`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AssistantText(String),
    ToolUse(String),
    ToolResult(String),
    Thinking(String),
    TurnComplete,
    TurnError { kind: ErrorKind, detail: String },
}

impl TransportEvent {
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::TurnError {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete | Self::TurnError { .. })
    }
}

/// Capability set of a live conversation.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Idempotently bring up the tool-server child and the vendor session.
    /// On failure no partial state remains.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Start one turn. Non-blocking: events for the turn arrive on the
    /// returned channel. Rejects a second in-flight turn with `busy`.
    fn submit(&mut self, prompt: &str)
        -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Request cooperative cancellation of the running turn; the event
    /// stream terminates with `TurnError(cancelled)` shortly after.
    async fn cancel(&mut self);

    /// Tear down the vendor session and the child process. Safe in any
    /// state; never blocks indefinitely.
    async fn close(&mut self);
}

/// Tag for the concrete transport variants a factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Owns the vendor HTTP session and the tool-server child directly.
    Direct,
}

/// Builds a transport bound to one model entry. Sessions go through this
/// on start and on every model switch.
pub trait TransportFactory: Send + Sync {
    fn build(&self, entry: &ModelEntry) -> Result<Box<dyn AgentTransport>, TransportError>;
}

pub use direct::DirectFactory;

//! Per-connection state machine.
//!
//! One `Session` pairs one WebSocket with at most one open transport. The
//! gateway's read loop feeds it frames and transport events serially; every
//! handler runs to completion before the next is dispatched, which is what
//! makes the state transitions atomic with respect to frame order.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{sanitize_detail, ErrorKind};
use crate::registry::{ModelEntry, ModelRegistry};
use crate::transport::{AgentTransport, TransportEvent, TransportFactory};
use chatbox_protocol::{ChatMessage, ChunkKind, ClientFrame, StreamChunk};

/// How long the outbound queue may stay saturated before the session gives
/// up on the consumer.
const SLOW_CONSUMER_PAUSE: Duration = Duration::from_secs(10);
/// How long to wait for a cancelled transport to acknowledge before the
/// reset is forced through.
const RESET_ACK_GRACE: Duration = Duration::from_secs(5);

const CONNECTED_BANNER: &str =
    "Connected to the inventory chatbox. Ask me about your network infrastructure!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    AwaitingTurn,
    SwitchingModel,
    Resetting,
    Closing,
}

/// The peer is gone (or hopeless); the caller should tear the connection
/// down.
#[derive(Debug)]
pub struct ConnectionClosed;

type EmitResult = Result<(), ConnectionClosed>;

pub struct Session {
    connection_id: Uuid,
    config: Arc<Config>,
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn TransportFactory>,
    outbound: mpsc::Sender<StreamChunk>,
    events_tx: mpsc::Sender<(u64, TransportEvent)>,
    transport: Option<Box<dyn AgentTransport>>,
    model_id: String,
    phase: SessionPhase,
    turn_seq: u64,
    deadline: Option<Instant>,
    partial: String,
    archived: Vec<ChatMessage>,
    last_activity: Instant,
}

impl Session {
    /// Returns the session and the receiver half of its internal event
    /// channel; the caller multiplexes that receiver with the socket.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn TransportFactory>,
        outbound: mpsc::Sender<StreamChunk>,
    ) -> (Self, mpsc::Receiver<(u64, TransportEvent)>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let model_id = registry.default_id().to_string();
        let session = Self {
            connection_id: Uuid::new_v4(),
            config,
            registry,
            factory,
            outbound,
            events_tx,
            transport: None,
            model_id,
            phase: SessionPhase::Idle,
            turn_seq: 0,
            deadline: None,
            partial: String::new(),
            archived: Vec::new(),
            last_activity: Instant::now(),
        };
        (session, events_rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Messages the server synthesized on model switches, oldest first.
    pub fn archived(&self) -> &[ChatMessage] {
        &self.archived
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// First contact: the `connected` banner goes out before anything else,
    /// then the initial transport comes up.
    pub async fn start(&mut self) -> EmitResult {
        let registry = self.registry.clone();
        let entry = registry
            .lookup(&self.model_id)
            .unwrap_or_else(|| registry.default_entry());

        let mut metadata = Map::new();
        metadata.insert("model".to_string(), model_metadata(entry));
        self.emit(
            StreamChunk::new(ChunkKind::Connected, CONNECTED_BANNER).with_metadata(metadata),
        )
        .await?;

        if let Err(err) = self.build_and_open(entry).await {
            warn!(connection = %self.connection_id, "initial transport failed: {err}");
            self.emit_error(err.kind, err.detail).await?;
        } else {
            info!(connection = %self.connection_id, model = %self.model_id, "session started");
        }
        Ok(())
    }

    /// One inbound text frame. Malformed input costs one error chunk, never
    /// the connection.
    pub async fn handle_frame(&mut self, raw: &str) -> EmitResult {
        self.last_activity = Instant::now();
        match chatbox_protocol::decode_client_frame(raw) {
            Ok(ClientFrame::Prompt { message }) => self.handle_prompt(message).await,
            Ok(ClientFrame::Reset) => self.handle_reset().await,
            Ok(ClientFrame::ModelChange { model }) => self.handle_model_change(model).await,
            Err(err) => {
                debug!(connection = %self.connection_id, "bad frame: {err}");
                self.emit_error(ErrorKind::BadFrame, err.to_string()).await
            }
        }
    }

    pub async fn handle_binary(&mut self) -> EmitResult {
        self.emit_error(ErrorKind::BadFrame, "binary frames are not supported")
            .await
    }

    async fn handle_prompt(&mut self, message: String) -> EmitResult {
        if self.phase != SessionPhase::Idle {
            return self
                .emit_error(ErrorKind::Busy, "a turn is already in flight")
                .await;
        }
        let Some(transport) = self.transport.as_mut() else {
            return self
                .emit_error(
                    ErrorKind::ToolBackendUnavailable,
                    "no active agent transport; switch models to reconnect",
                )
                .await;
        };

        self.turn_seq += 1;
        let seq = self.turn_seq;
        match transport.submit(&message) {
            Ok(mut events) => {
                let forward = self.events_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if forward.send((seq, event)).await.is_err() {
                            break;
                        }
                    }
                });
                self.phase = SessionPhase::AwaitingTurn;
                self.partial.clear();
                self.deadline = Some(Instant::now() + self.config.turn_budget);
                Ok(())
            }
            Err(err) => self.emit_error(err.kind, err.detail).await,
        }
    }

    async fn handle_reset(&mut self) -> EmitResult {
        match self.phase {
            SessionPhase::AwaitingTurn => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.cancel().await;
                }
                self.phase = SessionPhase::Resetting;
                self.deadline = Some(Instant::now() + RESET_ACK_GRACE);
                Ok(())
            }
            // Idle (and a redundant reset while one is pending) completes
            // immediately; state is left unchanged.
            _ => self.emit_reset_complete().await,
        }
    }

    async fn handle_model_change(&mut self, id: String) -> EmitResult {
        let registry = self.registry.clone();
        let Some(entry) = registry.lookup(&id) else {
            return self
                .emit_error(
                    ErrorKind::UnknownModel,
                    format!("model {id:?} is not in the registry"),
                )
                .await;
        };
        if !registry.is_available(entry).await {
            return self
                .emit_error(
                    ErrorKind::ModelUnavailable,
                    format!("model {id:?} is currently unavailable"),
                )
                .await;
        }

        // A pending reset is still owed its acknowledgement; the switch
        // tears the turn down either way.
        if self.phase == SessionPhase::Resetting {
            self.emit_reset_complete().await?;
        }
        self.phase = SessionPhase::SwitchingModel;

        // Whatever the cancelled turn produced so far is archived for the
        // client; it has no other way to observe the partial answer.
        let mut synthesized = Vec::new();
        if !self.partial.is_empty() {
            let message = ChatMessage::assistant(std::mem::take(&mut self.partial));
            self.archived.push(message.clone());
            synthesized.push(message);
        }

        if let Some(mut old) = self.transport.take() {
            old.close().await;
        }
        self.turn_seq += 1;
        self.deadline = None;

        let previous = self.model_id.clone();
        let result = self.build_and_open(entry).await;
        self.phase = SessionPhase::Idle;
        match result {
            Ok(()) => {
                self.model_id = entry.id.clone();
                info!(
                    connection = %self.connection_id,
                    from = %previous,
                    to = %entry.id,
                    "model switched"
                );
                let mut metadata = Map::new();
                metadata.insert("model".to_string(), model_metadata(entry));
                metadata.insert("previous".to_string(), Value::String(previous));
                metadata.insert(
                    "archived_messages".to_string(),
                    serde_json::to_value(&synthesized).unwrap_or_else(|_| json!([])),
                );
                self.emit(
                    StreamChunk::new(
                        ChunkKind::ModelChanged,
                        format!("Switched to {}", entry.name),
                    )
                    .with_metadata(metadata),
                )
                .await
            }
            Err(err) => {
                warn!(
                    connection = %self.connection_id,
                    model = %entry.id,
                    "transport rebuild failed: {err}"
                );
                self.emit_error(err.kind, err.detail).await
            }
        }
    }

    /// One event from the transport pump. Events from superseded turns are
    /// discarded by sequence number.
    pub async fn handle_transport_event(
        &mut self,
        seq: u64,
        event: TransportEvent,
    ) -> EmitResult {
        if seq != self.turn_seq {
            return Ok(());
        }
        match self.phase {
            SessionPhase::AwaitingTurn => match event {
                TransportEvent::AssistantText(text) => {
                    self.partial.push_str(&text);
                    self.emit(StreamChunk::text(text, false)).await
                }
                TransportEvent::ToolUse(name) => {
                    self.emit(StreamChunk::new(
                        ChunkKind::ToolUse,
                        format!("Using tool: {name}"),
                    ))
                    .await
                }
                TransportEvent::ToolResult(payload) => {
                    self.emit(StreamChunk::new(ChunkKind::ToolResult, payload))
                        .await
                }
                TransportEvent::Thinking(snippet) => {
                    self.emit(StreamChunk::new(ChunkKind::Thinking, snippet)).await
                }
                TransportEvent::TurnComplete => {
                    self.finish_turn();
                    self.emit(StreamChunk::text("", true)).await
                }
                TransportEvent::TurnError { kind, detail } => {
                    self.finish_turn();
                    self.emit_error(kind, detail).await
                }
            },
            SessionPhase::Resetting => {
                // Chunks from the cancelled turn are dropped; its terminal
                // event is the cancellation acknowledgement.
                if event.is_terminal() {
                    self.finish_turn();
                    self.emit_reset_complete().await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Fires when the turn budget (or the reset acknowledgement grace)
    /// elapses.
    pub async fn handle_deadline(&mut self) -> EmitResult {
        self.deadline = None;
        match self.phase {
            SessionPhase::AwaitingTurn => {
                warn!(
                    connection = %self.connection_id,
                    budget_secs = self.config.turn_budget.as_secs(),
                    "turn budget exceeded"
                );
                if let Some(transport) = self.transport.as_mut() {
                    transport.cancel().await;
                }
                self.finish_turn();
                self.emit_error(ErrorKind::Timeout, "turn budget exceeded")
                    .await
            }
            SessionPhase::Resetting => {
                warn!(connection = %self.connection_id, "transport never acknowledged the cancellation");
                self.finish_turn();
                self.emit_reset_complete().await
            }
            _ => Ok(()),
        }
    }

    pub async fn close(&mut self) {
        self.phase = SessionPhase::Closing;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        info!(connection = %self.connection_id, "session closed");
    }

    fn finish_turn(&mut self) {
        self.phase = SessionPhase::Idle;
        self.deadline = None;
        self.partial.clear();
        // Anything still in flight from this turn is now stale.
        self.turn_seq += 1;
    }

    async fn build_and_open(&mut self, entry: &ModelEntry) -> Result<(), crate::TransportError> {
        let mut transport = self.factory.build(entry)?;
        transport.open().await?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn emit_reset_complete(&mut self) -> EmitResult {
        self.emit(StreamChunk::new(ChunkKind::ResetComplete, "ok")).await
    }

    async fn emit_error(&mut self, kind: ErrorKind, detail: impl Into<String>) -> EmitResult {
        let detail = sanitize_detail(&detail.into(), &self.config);
        let mut chunk = StreamChunk::error(kind.token());
        if !detail.is_empty() {
            let mut metadata = Map::new();
            metadata.insert("detail".to_string(), Value::String(detail));
            chunk = chunk.with_metadata(metadata);
        }
        self.emit(chunk).await
    }

    async fn emit(&self, chunk: StreamChunk) -> EmitResult {
        match self
            .outbound
            .send_timeout(chunk, SLOW_CONSUMER_PAUSE)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    connection = %self.connection_id,
                    "outbound queue saturated for {}s; dropping slow consumer",
                    SLOW_CONSUMER_PAUSE.as_secs()
                );
                // Best effort: the consumer may drain just enough to see why
                // it was dropped.
                let _ = self
                    .outbound
                    .try_send(StreamChunk::error(ErrorKind::SlowConsumer.token()));
                Err(ConnectionClosed)
            }
            Err(SendTimeoutError::Closed(_)) => Err(ConnectionClosed),
        }
    }
}

fn model_metadata(entry: &ModelEntry) -> Value {
    json!({
        "id": entry.id,
        "name": entry.name,
        "isAuto": entry.is_auto(),
    })
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use chatbox_core::transport::{AgentTransport, TransportEvent, TransportFactory};
use chatbox_core::{Config, ErrorKind, ModelRegistry, TransportError};
use chatbox_gateway::{build_router, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted transport: the prompt text selects the behavior, so tests can
/// drive every turn outcome without a vendor or a child process.
pub struct ScriptedTransport {
    cancel: CancellationToken,
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn submit(
        &mut self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(8);
        let cancel = self.cancel.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            match prompt.as_str() {
                "hello" => {
                    let _ = tx
                        .send(TransportEvent::AssistantText("Hi".to_string()))
                        .await;
                    let _ = tx.send(TransportEvent::TurnComplete).await;
                }
                "again" => {
                    let _ = tx
                        .send(TransportEvent::AssistantText("Once more".to_string()))
                        .await;
                    let _ = tx.send(TransportEvent::TurnComplete).await;
                }
                "use a tool" => {
                    let _ = tx
                        .send(TransportEvent::ToolUse("netbox_get_objects".to_string()))
                        .await;
                    let _ = tx
                        .send(TransportEvent::ToolResult("3 sites".to_string()))
                        .await;
                    let _ = tx
                        .send(TransportEvent::AssistantText(
                            "You have 3 sites.".to_string(),
                        ))
                        .await;
                    let _ = tx.send(TransportEvent::TurnComplete).await;
                }
                "long job" => {
                    let _ = tx
                        .send(TransportEvent::AssistantText("Working".to_string()))
                        .await;
                    cancel.cancelled().await;
                    let _ = tx
                        .send(TransportEvent::error(ErrorKind::Cancelled, "turn cancelled"))
                        .await;
                }
                "die" => {
                    let _ = tx
                        .send(TransportEvent::error(
                            ErrorKind::ToolBackendUnavailable,
                            "tool server exited during the turn",
                        ))
                        .await;
                }
                // Anything else hangs until cancelled: the timeout tests
                // rely on it.
                _ => {
                    cancel.cancelled().await;
                    let _ = tx
                        .send(TransportEvent::error(ErrorKind::Cancelled, "turn cancelled"))
                        .await;
                }
            }
        });
        Ok(rx)
    }

    async fn cancel(&mut self) {
        self.cancel.cancel();
    }

    async fn close(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ScriptedFactory;

impl TransportFactory for ScriptedFactory {
    fn build(
        &self,
        _entry: &chatbox_core::ModelEntry,
    ) -> Result<Box<dyn AgentTransport>, TransportError> {
        Ok(Box::new(ScriptedTransport {
            cancel: CancellationToken::new(),
        }))
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> Arc<Config> {
    let mut env: HashMap<String, String> = HashMap::from([
        ("ANTHROPIC_API_KEY".to_string(), "sk-ant-test0001".to_string()),
        (
            "NETBOX_URL".to_string(),
            "http://netbox.example.com".to_string(),
        ),
        (
            "NETBOX_TOKEN".to_string(),
            "0123456789abcdef0123456789abcdef01234567".to_string(),
        ),
        ("TOOL_SERVER_COMMAND".to_string(), "uv".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert((*key).to_string(), (*value).to_string());
    }
    Arc::new(Config::from_lookup(|key| env.get(key).cloned()).expect("test config"))
}

pub struct TestGateway {
    pub addr: SocketAddr,
}

impl TestGateway {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Bind an ephemeral port and serve the router with the scripted factory.
pub async fn spawn_gateway(overrides: &[(&str, &str)]) -> TestGateway {
    let config = test_config(overrides);
    let registry = Arc::new(ModelRegistry::new(&config));
    let state = AppState::with_factory(config, registry, Arc::new(ScriptedFactory));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestGateway { addr }
}

pub async fn connect(gateway: &TestGateway) -> WsClient {
    let (ws, _) = connect_async(gateway.ws_url()).await.expect("ws connect");
    ws
}

pub async fn send_text(ws: &mut WsClient, raw: &str) {
    ws.send(Message::Text(raw.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON chunk from the server; panics on close or timeout.
pub async fn recv_chunk(ws: &mut WsClient) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("chunk before timeout")
            .expect("socket still open")
            .expect("clean frame");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("chunk is JSON")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Drain chunks until one with `completed == true` arrives; returns the
/// whole turn in order.
pub async fn recv_turn(ws: &mut WsClient) -> Vec<Value> {
    let mut chunks = Vec::new();
    loop {
        let chunk = recv_chunk(ws).await;
        let done = chunk["completed"] == Value::Bool(true);
        chunks.push(chunk);
        if done {
            return chunks;
        }
    }
}

//! Client for the tool-server child process.
//!
//! The child is spawned with an environment built entirely from the
//! configuration allowlist (`env_clear` first) and speaks JSON-RPC 2.0 over
//! newline-delimited frames on its standard streams. Its stderr is folded
//! into the gateway log; its exit is observed by a monitor task so callers
//! can fail fast instead of hanging on a dead pipe.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, TransportError};
use crate::transport::llm::ToolDefinition;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace window between closing stdin and sending SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct RpcError {
    code: i64,
    message: String,
}

type RpcReply = Result<Value, RpcError>;

pub struct McpClient {
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>>,
    next_id: AtomicI64,
    exited: watch::Receiver<Option<i32>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_requested: Arc<AtomicBool>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("exited", &self.exited.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Spawn the child and perform the MCP handshake. On handshake failure
    /// the child is reaped before the error is returned, so no partial
    /// state survives.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let client = Self::spawn_raw(command, args, env)?;
        if let Err(err) = client.initialize().await {
            client.shutdown().await;
            return Err(err);
        }
        Ok(client)
    }

    /// Spawn the child without the handshake. Split out so process-level
    /// behavior (environment, shutdown) is testable against plain commands.
    pub fn spawn_raw(
        command: &str,
        args: &[String],
        env: BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(command)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TransportError::new(
                    ErrorKind::ToolBackendUnavailable,
                    format!("failed to spawn tool server {command:?}: {err}"),
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::new(ErrorKind::Internal, "tool server stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::new(ErrorKind::Internal, "tool server stdout not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::new(ErrorKind::Internal, "tool server stderr not captured")
        })?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(child = "mcp", "{line}");
            }
        });

        let pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(read_responses(stdout, pending.clone()));

        let (exit_tx, exited) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        tokio::spawn(monitor_child(
            child,
            exit_tx,
            kill_rx,
            shutdown_requested.clone(),
        ));

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicI64::new(1),
            exited,
            kill_tx: Mutex::new(Some(kill_tx)),
            shutdown_requested,
        })
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "chatbox-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        timeout(HANDSHAKE_TIMEOUT, self.request("initialize", params))
            .await
            .map_err(|_| {
                TransportError::new(
                    ErrorKind::ToolBackendUnavailable,
                    "tool server did not answer the initialize handshake in time",
                )
            })??;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(ToolDefinition {
                    name,
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    /// Invoke one tool and flatten its content blocks to a display string.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, TransportError> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let mut parts = Vec::new();
        if let Some(blocks) = result.get("content").and_then(Value::as_array) {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
        }
        let mut payload = parts.join("\n");
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            payload = format!("tool error: {payload}");
        }
        Ok(payload)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exited.clone()
    }

    /// Graceful stop, then a forced kill after the grace window. Never
    /// blocks past twice the grace window.
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
        // Closing stdin is the cooperative stop signal for a stdio server.
        self.stdin.lock().await.take();
        let mut exited = self.exited.clone();
        if timeout(SHUTDOWN_GRACE, exited.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            return;
        }
        warn!("tool server ignored stdin close; killing it");
        if let Some(kill) = self.kill_tx.lock().await.take() {
            let _ = kill.send(());
        }
        let _ = timeout(SHUTDOWN_GRACE, exited.wait_for(Option::is_some)).await;
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.has_exited() {
            return Err(backend_gone(method));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_line(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let mut exited = self.exited.clone();
        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(TransportError::internal(format!(
                    "tool server rejected {method}: {} (code {})",
                    err.message, err.code
                ))),
                Err(_) => Err(backend_gone(method)),
            },
            _ = wait_for_exit(&mut exited) => {
                self.pending.lock().await.remove(&id);
                Err(backend_gone(method))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&frame).await
    }

    async fn write_line(&self, frame: &Value) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(TransportError::new(
                ErrorKind::ToolBackendUnavailable,
                "tool server stdin already closed",
            ));
        };
        let mut line = frame.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(|err| {
            TransportError::new(
                ErrorKind::ToolBackendUnavailable,
                format!("failed to write to tool server: {err}"),
            )
        })
    }
}

/// Waits until `exited` reports the child has exited, without holding a
/// `watch::Ref` across an await point (which would make the returned future
/// `!Send` and unusable inside `tokio::select!` in a spawned task).
pub(crate) async fn wait_for_exit(exited: &mut watch::Receiver<Option<i32>>) {
    loop {
        if exited.borrow().is_some() {
            return;
        }
        if exited.changed().await.is_err() {
            return;
        }
    }
}

fn backend_gone(method: &str) -> TransportError {
    TransportError::new(
        ErrorKind::ToolBackendUnavailable,
        format!("tool server exited before {method} completed"),
    )
}

async fn read_responses(
    stdout: ChildStdout,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!(child = "mcp", "discarding non-JSON frame: {err}");
                continue;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_i64) else {
            let method = value.get("method").and_then(Value::as_str).unwrap_or("?");
            debug!(child = "mcp", "notification: {}", method);
            continue;
        };
        let reply = match value.get("error") {
            Some(error) => Err(RpcError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(reply);
        }
    }

    // EOF: fail whatever is still waiting.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(RpcError {
            code: -1,
            message: "tool server stream closed".to_string(),
        }));
    }
}

async fn monitor_child(
    mut child: Child,
    exit_tx: watch::Sender<Option<i32>>,
    mut kill_rx: oneshot::Receiver<()>,
    shutdown_requested: Arc<AtomicBool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => {
            if shutdown_requested.load(Ordering::Relaxed) {
                info!("tool server exited: {status}");
            } else {
                warn!("tool server exited unexpectedly: {status}");
            }
            status.code().unwrap_or(-1)
        }
        Err(err) => {
            warn!("failed to reap tool server: {err}");
            -1
        }
    };
    let _ = exit_tx.send(Some(code));
}

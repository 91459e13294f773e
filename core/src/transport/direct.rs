//! The direct transport: one vendor HTTP session plus one tool-server
//! child, driven by an agent loop that feeds tool results back to the
//! model until it stops asking for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorKind, TransportError};
use crate::mcp::{wait_for_exit, McpClient};
use crate::registry::ModelEntry;
use crate::transport::anthropic::{AnthropicClient, DEFAULT_MODEL};
use crate::transport::llm::{
    CompletionRequest, ContentBlock, LlmClient, ToolDefinition, VendorMessage, VendorTurn,
};
use crate::transport::{AgentTransport, TransportEvent, TransportFactory, TransportKind};

const TURN_EVENT_BUFFER: usize = 32;
const MAX_TOKENS: u32 = 4096;
const TOOL_RESULT_PREVIEW: usize = 600;
const TURN_JOIN_GRACE: Duration = Duration::from_secs(2);

const SYSTEM_DIRECTIVE: &str = "You are a network inventory assistant. \
Help users query and understand their inventory data. \
Use the available tools to retrieve information. \
Be concise and focus on answering the user's specific question. \
When showing data, format it clearly using markdown tables or lists.";

/// Builds [`DirectTransport`] instances. The kind tag exists so additional
/// variants (for example a proxy transport) can hang off the same factory
/// seam without the session caring.
pub struct DirectFactory {
    kind: TransportKind,
    config: Arc<Config>,
}

impl DirectFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            kind: TransportKind::Direct,
            config,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl TransportFactory for DirectFactory {
    fn build(&self, entry: &ModelEntry) -> Result<Box<dyn AgentTransport>, TransportError> {
        Ok(Box::new(DirectTransport::new(self.config.clone(), entry)?))
    }
}

struct TurnHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DirectTransport {
    config: Arc<Config>,
    vendor_handle: String,
    llm: Arc<dyn LlmClient>,
    mcp: Option<Arc<McpClient>>,
    tools: Arc<Vec<ToolDefinition>>,
    history: Arc<Mutex<Vec<VendorMessage>>>,
    turn: Option<TurnHandle>,
    failed: Arc<AtomicBool>,
    opened: bool,
}

impl DirectTransport {
    pub fn new(config: Arc<Config>, entry: &ModelEntry) -> Result<Self, TransportError> {
        let vendor_handle = entry
            .vendor_handle
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let llm = Arc::new(AnthropicClient::new(config.llm_api_key.clone())?);
        Ok(Self::with_llm(config, vendor_handle, llm))
    }

    /// Seam for tests: any [`LlmClient`] in place of the HTTP one.
    pub fn with_llm(
        config: Arc<Config>,
        vendor_handle: String,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            config,
            vendor_handle,
            llm,
            mcp: None,
            tools: Arc::new(Vec::new()),
            history: Arc::new(Mutex::new(Vec::new())),
            turn: None,
            failed: Arc::new(AtomicBool::new(false)),
            opened: false,
        }
    }

    fn turn_in_flight(&self) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|turn| !turn.task.is_finished())
    }
}

#[async_trait]
impl AgentTransport for DirectTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.opened {
            return Ok(());
        }
        let mcp = McpClient::spawn(
            &self.config.tool_server_command,
            &self.config.tool_server_args,
            self.config.child_env(),
        )
        .await?;

        let advertised = match mcp.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                mcp.shutdown().await;
                return Err(err);
            }
        };
        let tools: Vec<ToolDefinition> = advertised
            .into_iter()
            .filter(|tool| tool_allowed(&self.config.allowed_tool_prefixes, &tool.name))
            .collect();
        debug!(tools = tools.len(), "tool server ready");

        self.mcp = Some(Arc::new(mcp));
        self.tools = Arc::new(tools);
        self.opened = true;
        Ok(())
    }

    fn submit(
        &mut self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(TransportError::new(
                ErrorKind::ToolBackendUnavailable,
                "tool backend previously failed; switch models to reconnect",
            ));
        }
        let Some(mcp) = self.mcp.clone() else {
            return Err(TransportError::internal("transport is not open"));
        };
        if self.turn_in_flight() {
            return Err(TransportError::new(
                ErrorKind::Busy,
                "a turn is already in flight",
            ));
        }

        let (tx, rx) = mpsc::channel(TURN_EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let ctx = TurnContext {
            llm: self.llm.clone(),
            mcp,
            history: self.history.clone(),
            tools: self.tools.clone(),
            allowed_prefixes: self.config.allowed_tool_prefixes.clone(),
            vendor_handle: self.vendor_handle.clone(),
            failed: self.failed.clone(),
            events: tx,
            cancel: cancel.clone(),
        };
        let prompt = prompt.to_string();
        let task = tokio::spawn(async move { run_turn(ctx, prompt).await });
        self.turn = Some(TurnHandle { cancel, task });
        Ok(rx)
    }

    async fn cancel(&mut self) {
        if let Some(turn) = &self.turn {
            turn.cancel.cancel();
        }
    }

    async fn close(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            if tokio::time::timeout(TURN_JOIN_GRACE, turn.task).await.is_err() {
                warn!("turn task did not stop within the grace window");
            }
        }
        if let Some(mcp) = self.mcp.take() {
            mcp.shutdown().await;
        }
        self.opened = false;
    }
}

struct TurnContext {
    llm: Arc<dyn LlmClient>,
    mcp: Arc<McpClient>,
    history: Arc<Mutex<Vec<VendorMessage>>>,
    tools: Arc<Vec<ToolDefinition>>,
    allowed_prefixes: Vec<String>,
    vendor_handle: String,
    failed: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl TurnContext {
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn fail(&self, kind: ErrorKind, detail: impl Into<String>) {
        if kind == ErrorKind::ToolBackendUnavailable {
            self.failed.store(true, Ordering::Relaxed);
        }
        let _ = self.emit(TransportEvent::error(kind, detail)).await;
    }
}

async fn run_turn(ctx: TurnContext, prompt: String) {
    ctx.history.lock().await.push(VendorMessage::user_text(prompt));
    let mut exited = ctx.mcp.exit_watch();

    loop {
        let request = CompletionRequest {
            model: ctx.vendor_handle.clone(),
            system: SYSTEM_DIRECTIVE.to_string(),
            messages: ctx.history.lock().await.clone(),
            tools: ctx.tools.as_ref().clone(),
            max_tokens: MAX_TOKENS,
        };

        let turn: VendorTurn = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                ctx.fail(ErrorKind::Cancelled, "turn cancelled").await;
                return;
            }
            _ = wait_for_exit(&mut exited) => {
                ctx.fail(
                    ErrorKind::ToolBackendUnavailable,
                    "tool server exited during the turn",
                )
                .await;
                return;
            }
            result = ctx.llm.complete(request) => match result {
                Ok(turn) => turn,
                Err(err) => {
                    ctx.fail(err.kind, err.detail).await;
                    return;
                }
            },
        };

        // Replay only what the vendor accepts back: text and tool_use.
        let kept: Vec<ContentBlock> = turn
            .blocks
            .iter()
            .filter(|block| {
                matches!(
                    block,
                    ContentBlock::Text { .. } | ContentBlock::ToolUse { .. }
                )
            })
            .cloned()
            .collect();
        if !kept.is_empty() {
            ctx.history.lock().await.push(VendorMessage::assistant(kept));
        }

        let wants_tools = turn.wants_tools();
        let mut tool_results = Vec::new();
        for block in turn.blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() && !ctx.emit(TransportEvent::AssistantText(text)).await {
                        return;
                    }
                }
                ContentBlock::Thinking { thinking } => {
                    if !ctx.emit(TransportEvent::Thinking(thinking)).await {
                        return;
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    if !tool_allowed(&ctx.allowed_prefixes, &name) {
                        ctx.fail(
                            ErrorKind::ToolNotAllowed,
                            format!("tool {name} is not in the allow-list"),
                        )
                        .await;
                        return;
                    }
                    if !ctx.emit(TransportEvent::ToolUse(name.clone())).await {
                        return;
                    }

                    let payload = tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            ctx.fail(ErrorKind::Cancelled, "turn cancelled").await;
                            return;
                        }
                        _ = wait_for_exit(&mut exited) => {
                            ctx.fail(
                                ErrorKind::ToolBackendUnavailable,
                                "tool server exited during a tool call",
                            )
                            .await;
                            return;
                        }
                        result = ctx.mcp.call_tool(&name, input) => match result {
                            Ok(payload) => payload,
                            Err(err) => {
                                ctx.fail(err.kind, err.detail).await;
                                return;
                            }
                        },
                    };

                    if !ctx
                        .emit(TransportEvent::ToolResult(truncate(
                            &payload,
                            TOOL_RESULT_PREVIEW,
                        )))
                        .await
                    {
                        return;
                    }
                    tool_results.push(ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: payload,
                        is_error: None,
                    });
                }
                ContentBlock::ToolResult { .. } => {}
                ContentBlock::Unknown => {
                    warn!("dropping unrecognized content block from the vendor stream");
                }
            }
        }

        if !wants_tools || tool_results.is_empty() {
            let _ = ctx.emit(TransportEvent::TurnComplete).await;
            return;
        }
        ctx.history
            .lock()
            .await
            .push(VendorMessage::user_tool_results(tool_results));
    }
}

fn tool_allowed(prefixes: &[String], name: &str) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn test_config(command: &str, args: &str) -> Arc<Config> {
        let env = HashMap::from([
            ("ANTHROPIC_API_KEY", "sk-ant-test0001".to_string()),
            ("NETBOX_URL", "http://netbox.example.com".to_string()),
            ("NETBOX_TOKEN", "token-value".to_string()),
            ("TOOL_SERVER_COMMAND", command.to_string()),
            ("TOOL_SERVER_ARGS", args.to_string()),
        ]);
        Arc::new(Config::from_lookup(|key| env.get(key).cloned()).unwrap())
    }

    fn stub_server() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("stub.sh");
        let mut file = std::fs::File::create(&script).expect("create stub");
        writeln!(
            file,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[]}}}}\n' "$id"
  fi
done"#
        )
        .expect("write stub");
        (dir, script.to_string_lossy().to_string())
    }

    /// Scripted vendor: one text-only answer.
    struct ScriptedLlm;

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<VendorTurn, TransportError> {
            Ok(VendorTurn {
                blocks: vec![ContentBlock::Text {
                    text: "Hi".to_string(),
                }],
                stop_reason: Some("end_turn".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn text_only_turn_completes() {
        let (_dir, script) = stub_server();
        let config = test_config("sh", &script);
        let mut transport =
            DirectTransport::with_llm(config, DEFAULT_MODEL.to_string(), Arc::new(ScriptedLlm));
        transport.open().await.expect("open");

        let mut rx = transport.submit("hello").expect("submit");
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::AssistantText("Hi".to_string()))
        );
        assert_eq!(rx.recv().await, Some(TransportEvent::TurnComplete));
        assert_eq!(rx.recv().await, None);

        // Second turn is accepted once the first finished.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rx = transport.submit("again").expect("second submit");
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                break;
            }
        }
        transport.close().await;
    }

    #[tokio::test]
    async fn concurrent_submit_is_busy() {
        struct StallingLlm;
        #[async_trait]
        impl LlmClient for StallingLlm {
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> Result<VendorTurn, TransportError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                unreachable!("stalled")
            }
        }

        let (_dir, script) = stub_server();
        let config = test_config("sh", &script);
        let mut transport =
            DirectTransport::with_llm(config, DEFAULT_MODEL.to_string(), Arc::new(StallingLlm));
        transport.open().await.expect("open");

        let _rx = transport.submit("first").expect("submit");
        let err = transport.submit("second").expect_err("must be busy");
        assert_eq!(err.kind, ErrorKind::Busy);
        transport.close().await;
    }

    #[tokio::test]
    async fn cancel_terminates_the_event_stream() {
        struct StallingLlm;
        #[async_trait]
        impl LlmClient for StallingLlm {
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> Result<VendorTurn, TransportError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                unreachable!("stalled")
            }
        }

        let (_dir, script) = stub_server();
        let config = test_config("sh", &script);
        let mut transport =
            DirectTransport::with_llm(config, DEFAULT_MODEL.to_string(), Arc::new(StallingLlm));
        transport.open().await.expect("open");

        let mut rx = transport.submit("first").expect("submit");
        transport.cancel().await;
        let event = rx.recv().await.expect("terminal event");
        assert!(
            matches!(
                event,
                TransportEvent::TurnError {
                    kind: ErrorKind::Cancelled,
                    ..
                }
            ),
            "{event:?}"
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn disallowed_tool_fails_the_turn() {
        struct RogueLlm;
        #[async_trait]
        impl LlmClient for RogueLlm {
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> Result<VendorTurn, TransportError> {
                Ok(VendorTurn {
                    blocks: vec![ContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: "shell_exec".to_string(),
                        input: serde_json::json!({}),
                    }],
                    stop_reason: Some("tool_use".to_string()),
                })
            }
        }

        let (_dir, script) = stub_server();
        let config = test_config("sh", &script);
        let mut transport =
            DirectTransport::with_llm(config, DEFAULT_MODEL.to_string(), Arc::new(RogueLlm));
        transport.open().await.expect("open");

        let mut rx = transport.submit("do something sneaky").expect("submit");
        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        assert!(
            matches!(
                terminal,
                Some(TransportEvent::TurnError {
                    kind: ErrorKind::ToolNotAllowed,
                    ..
                })
            ),
            "{terminal:?}"
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn open_failure_leaves_no_partial_state() {
        let config = test_config("/nonexistent/tool-server-binary", "");
        let mut transport =
            DirectTransport::with_llm(config, DEFAULT_MODEL.to_string(), Arc::new(ScriptedLlm));
        let err = transport.open().await.expect_err("open must fail");
        assert_eq!(err.kind, ErrorKind::ToolBackendUnavailable);
        assert!(transport.mcp.is_none());
        assert!(!transport.opened);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let truncated = truncate("héllo wörld", 6);
        assert!(truncated.ends_with("..."));
    }
}

//! Command-line client for the chatbox gateway.
//!
//! Speaks the same WebSocket grammar as the browser UI: one-shot queries
//! for scripting, or an interactive loop with `/reset` and `/model`
//! commands.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatbox_protocol::{ChunkKind, StreamChunk};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[91m";
const CYAN: &str = "\x1b[36m";
const BLUE: &str = "\x1b[94m";

#[derive(Parser, Debug)]
#[command(
    name = "chatbox",
    about = "Query the inventory chatbox from the command line"
)]
struct Cli {
    /// Query to execute (omit for interactive mode).
    query: Vec<String>,

    /// WebSocket URL of the gateway.
    #[arg(long, default_value = "ws://127.0.0.1:8000/ws/chat")]
    url: String,

    /// Show tool activity and status messages.
    #[arg(short, long)]
    verbose: bool,

    /// Print raw JSON chunks instead of rendered text.
    #[arg(long)]
    json: bool,

    /// Disable ANSI colors.
    #[arg(long)]
    no_color: bool,

    /// Per-query timeout in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

struct Render {
    color: bool,
    verbose: bool,
    json: bool,
}

impl Render {
    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("{code}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    fn status(&self, text: &str) {
        if self.verbose && !self.json {
            eprintln!("{}", self.paint(CYAN, text));
        }
    }

    fn error(&self, text: &str) {
        eprintln!("{}", self.paint(RED, &format!("ERROR: {text}")));
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let render = Render {
        color: !cli.no_color && std::io::stdout().is_terminal(),
        verbose: cli.verbose,
        json: cli.json,
    };

    let code = if cli.query.is_empty() {
        interactive_mode(&cli, &render).await
    } else {
        single_query_mode(&cli, &render).await
    };
    match code {
        Ok(code) => code,
        Err(err) => {
            render.error(&format!("{err:#}"));
            std::process::ExitCode::FAILURE
        }
    }
}

async fn connect(url: &str) -> Result<WsClient> {
    let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .context("connection timeout; is the gateway running?")?
        .context("websocket connection failed")?;

    // The gateway greets first; swallow the banner so callers start clean.
    let first = timeout(CONNECT_TIMEOUT, ws.next())
        .await
        .context("no greeting from the gateway")?
        .context("connection closed during greeting")?
        .context("greeting read failed")?;
    if let Message::Text(text) = first {
        let chunk: StreamChunk =
            serde_json::from_str(text.as_str()).context("unparseable greeting")?;
        if chunk.kind != ChunkKind::Connected {
            bail!("expected a connected frame, got {:?}", chunk.kind);
        }
    }
    Ok(ws)
}

async fn single_query_mode(cli: &Cli, render: &Render) -> Result<std::process::ExitCode> {
    let query = cli.query.join(" ");
    render.status("Connecting...");
    let mut ws = connect(&cli.url).await?;
    render.status("Connected!");

    let frame = serde_json::json!({ "message": query }).to_string();
    let success = run_request(&mut ws, &frame, cli, render).await?;
    let _ = ws.close(None).await;
    Ok(if success {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::FAILURE
    })
}

async fn interactive_mode(cli: &Cli, render: &Render) -> Result<std::process::ExitCode> {
    render.status("Connecting...");
    let mut ws = connect(&cli.url).await?;
    eprintln!(
        "{}",
        render.paint(DIM, "Type a question, /reset, /model <id>, or /quit")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("{}", render.paint(CYAN, "you> "));
        std::io::stderr().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let frame = match line {
            "/quit" | "/exit" => break,
            "/reset" => serde_json::json!({ "type": "reset" }).to_string(),
            _ if line.starts_with("/model") => {
                let Some(id) = line.split_whitespace().nth(1) else {
                    render.error("usage: /model <id>");
                    continue;
                };
                serde_json::json!({ "type": "model_change", "model": id }).to_string()
            }
            _ if line.starts_with('/') => {
                render.error("unknown command; try /reset, /model <id>, /quit");
                continue;
            }
            _ => serde_json::json!({ "message": line }).to_string(),
        };

        if let Err(err) = run_request(&mut ws, &frame, cli, render).await {
            render.error(&format!("{err:#}"));
            break;
        }
    }
    let _ = ws.close(None).await;
    Ok(std::process::ExitCode::SUCCESS)
}

/// Send one frame and stream the answer until its terminal chunk. Returns
/// whether the request ended without an error chunk.
async fn run_request(
    ws: &mut WsClient,
    frame: &str,
    cli: &Cli,
    render: &Render,
) -> Result<bool> {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .context("failed to send frame")?;

    let budget = Duration::from_secs(cli.timeout);
    let started = tokio::time::Instant::now();
    let mut wrote_text = false;
    let mut success = true;

    loop {
        let remaining = budget
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .context("query timed out; response may be incomplete")?;
        let message = timeout(remaining, ws.next())
            .await
            .context("query timed out; response may be incomplete")?
            .context("connection closed unexpectedly")?
            .context("read failed")?;
        let Message::Text(text) = message else {
            continue;
        };

        if cli.json {
            println!("{}", text.as_str());
        }
        let chunk: StreamChunk =
            serde_json::from_str(text.as_str()).context("unparseable chunk")?;

        if !cli.json {
            match chunk.kind {
                ChunkKind::Text => {
                    if !chunk.content.is_empty() {
                        print!("{}", chunk.content);
                        std::io::stdout().flush().ok();
                        wrote_text = true;
                    }
                }
                ChunkKind::ToolUse => {
                    if render.verbose {
                        eprintln!("\n{}", render.paint(BLUE, &format!("[{}]", chunk.content)));
                    }
                }
                ChunkKind::Thinking => {
                    if render.verbose {
                        eprintln!("\n{}", render.paint(DIM, "[Thinking...]"));
                    }
                }
                ChunkKind::ToolResult => {
                    if render.verbose {
                        eprintln!(
                            "\n{}",
                            render.paint(DIM, &format!("[Tool result: {}]", chunk.content))
                        );
                    }
                }
                ChunkKind::Error => {
                    render.error(&chunk.content);
                    success = false;
                }
                ChunkKind::ResetComplete => {
                    render.status("Conversation reset.");
                }
                ChunkKind::ModelChanged => {
                    eprintln!("{}", render.paint(CYAN, &chunk.content));
                }
                ChunkKind::Connected => {}
            }
        }

        let terminal = chunk.completed
            || matches!(
                chunk.kind,
                ChunkKind::ResetComplete | ChunkKind::ModelChanged
            );
        if terminal {
            if wrote_text && !cli.json {
                println!();
            }
            return Ok(success);
        }
    }
}

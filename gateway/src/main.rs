use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatbox_core::Config;
use chatbox_gateway::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "chatbox-gateway", about = "WebSocket gateway for the inventory chatbox")]
struct Cli {
    /// Bind address for the HTTP server.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env().map_err(|err| anyhow::anyhow!("{err}"))?;

    // RUST_LOG wins when set; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();
    info!("configuration loaded: {config:?}");

    let state = AppState::new(Arc::new(config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!("gateway listening on http://{}", cli.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

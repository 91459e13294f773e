//! HTTP surface of the chatbox gateway: a health probe, the model listing,
//! and the `/ws/chat` streaming endpoint.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info};

use chatbox_core::transport::TransportFactory;
use chatbox_core::{Config, DirectFactory, ModelRegistry, Session};
use chatbox_protocol::{ModelDescriptor, StreamChunk};

/// Bound on queued outbound frames per connection; past this the consumer
/// is considered slow.
const WS_OUTGOING_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ModelRegistry>,
    pub factory: Arc<dyn TransportFactory>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let registry = Arc::new(ModelRegistry::new(&config));
        let factory = Arc::new(DirectFactory::new(config.clone()));
        Self {
            config,
            registry,
            factory,
        }
    }

    /// Assemble from parts; the seam tests use to inject a scripted
    /// transport factory.
    pub fn with_factory(
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/ws/chat", get(ws_chat))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_origin,
        ))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

/// Browser requests carry an `Origin` header; anything not on the allow-list
/// is refused before routing, so a disallowed WebSocket upgrade never
/// happens. Requests without the header (CLI clients, curl) pass through.
async fn enforce_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
    {
        if !state.config.origin_allowed(origin) {
            debug!("refusing request from origin {origin}");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    next.run(request).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "chatbox-gateway",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelDescriptor>> {
    Json(state.registry.list().await)
}

async fn ws_chat(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection wiring: a writer task drains the bounded outbound queue,
/// while this task multiplexes inbound frames, transport events, and the
/// session deadline. Inbound frames are handled strictly serially.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<StreamChunk>(WS_OUTGOING_BUFFER);
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx));

    let (mut session, mut events) = Session::new(
        state.config.clone(),
        state.registry.clone(),
        state.factory.clone(),
        outbound_tx,
    );
    info!(connection = %session.connection_id(), "websocket connected");

    if session.start().await.is_ok() {
        loop {
            let deadline = session.deadline();
            let result = tokio::select! {
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => session.handle_frame(&text).await,
                    Some(Ok(Message::Binary(_))) => session.handle_binary().await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => Ok(()),
                    Some(Err(err)) => {
                        debug!(connection = %session.connection_id(), "websocket read failed: {err}");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some((seq, event)) => session.handle_transport_event(seq, event).await,
                    None => Ok(()),
                },
                _ = tokio::time::sleep_until(wake_at(deadline)), if deadline.is_some() => {
                    session.handle_deadline().await
                }
            };
            if result.is_err() {
                break;
            }
        }
    }

    session.close().await;
    info!(connection = %session.connection_id(), "websocket disconnected");
    drop(session);
    let _ = writer.await;
}

fn wake_at(deadline: Option<Instant>) -> Instant {
    // The select branch is disabled when there is no deadline; the fallback
    // only exists so the expression is well-formed.
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut chunks: mpsc::Receiver<StreamChunk>,
) {
    while let Some(chunk) = chunks.recv().await {
        match serde_json::to_string(&chunk) {
            Ok(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => error!("failed to serialize outbound chunk: {err}"),
        }
    }
    let _ = ws_tx.close().await;
}

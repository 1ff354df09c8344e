//! # HTTP/WS Surface
//!
//! The axum router, request handlers and WebSocket session loops, plus the
//! `serve` entry point that wires the pipeline together and supervises
//! graceful shutdown.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, INGEST_CHANNEL_CAPACITY, SHUTDOWN_DRAIN_DEADLINE};
use crate::engine::{EngineClient, EngineError};
use crate::pipeline::{IngestPayload, Ingestor};
use crate::query::{self, ErrorsParams, SearchParams};
use crate::subscribers::{SubscriberFilter, SubscriberRegistry};
use crate::writer::BatchWriter;

/// Root state shared by every connection task, configured once at startup.
pub struct AppState {
    pub ingestor: Ingestor,
    pub registry: Arc<SubscriberRegistry>,
    pub engine: EngineClient,
    /// Flips to `true` when the process is shutting down; long-lived WS
    /// sessions watch it.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        ingestor: Ingestor,
        registry: Arc<SubscriberRegistry>,
        engine: EngineClient,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ingestor,
            registry,
            engine,
            shutdown,
        }
    }
}

/// Build the public router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/search", get(search))
        .route("/projects", get(projects))
        .route("/trace/{trace_id}", get(trace))
        .route("/errors", get(errors))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Start the gateway and block until shutdown completes.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let engine = EngineClient::new(&cfg.meili_host, &cfg.meili_key)?;
    probe_index(&engine).await?;

    let registry = SubscriberRegistry::new();
    let (records_tx, records_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let writer = BatchWriter::new(engine.clone(), records_rx);
    let writer_metrics = writer.metrics();
    let writer_handle = tokio::spawn(writer.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(
        Ingestor::new(records_tx, Arc::clone(&registry)),
        Arc::clone(&registry),
        engine,
        shutdown_rx,
    ));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("log gateway listening on {addr}");
    tracing::info!("  engine: {}", cfg.meili_host);
    tracing::info!("  POST /ingest        HTTP ingestion");
    tracing::info!("  GET  /ws            WebSocket ingest + subscribe");
    tracing::info!("  GET  /search        query records");
    tracing::info!("  GET  /projects      project breakdown");
    tracing::info!("  GET  /trace/:id     trace timeline");
    tracing::info!("  GET  /errors        error summary");

    let registry_at_shutdown = Arc::clone(&registry);
    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            // Close subscribe sessions and wake ingest sessions so the
            // connection tasks drain promptly.
            let _ = shutdown_tx.send(true);
            registry_at_shutdown.close_all();
        })
        .await?;

    // Dropping the state releases the last ingest sender; the writer then
    // drains the channel and performs its final flush.
    drop(state);
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE * 2, writer_handle).await;
    tracing::info!(
        flushed = writer_metrics
            .records_flushed
            .load(std::sync::atomic::Ordering::Relaxed),
        "gateway stopped"
    );
    Ok(())
}

/// Fail fast on a missing index or a rejected credential; tolerate an engine
/// that is merely unreachable.
async fn probe_index(engine: &EngineClient) -> anyhow::Result<()> {
    match engine.index_exists().await {
        Ok(true) => Ok(()),
        Ok(false) => anyhow::bail!(
            "engine index \"{}\" does not exist; run `logrelay init` first",
            crate::config::INDEX_NAME
        ),
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, "engine unreachable at startup, ingest will retry");
            Ok(())
        }
        Err(e) => anyhow::bail!("engine rejected startup probe: {e}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ingest(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: IngestPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return bad_request(format!("malformed ingest payload: {e}")),
    };
    let summary = state.ingestor.ingest(payload.into_records()).await;
    Json(summary).into_response()
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let request = match query::search_request(&params) {
        Ok(request) => request,
        Err(e) => return bad_request(e.to_string()),
    };
    match state.engine.search(&request).await {
        Ok(results) => Json(query::shape_search(results)).into_response(),
        Err(e) => engine_failure(e),
    }
}

async fn projects(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.search(&query::projects_request()).await {
        Ok(results) => Json(query::shape_projects(results)).into_response(),
        Err(e) => engine_failure(e),
    }
}

async fn trace(State(state): State<Arc<AppState>>, Path(trace_id): Path<String>) -> Response {
    let request = match query::trace_request(&trace_id) {
        Ok(request) => request,
        Err(e) => return bad_request(e.to_string()),
    };
    match state.engine.search(&request).await {
        Ok(results) => Json(query::shape_trace(&trace_id, results)).into_response(),
        Err(e) => engine_failure(e),
    }
}

async fn errors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ErrorsParams>,
) -> Response {
    let request = match query::errors_request(&params) {
        Ok(request) => request,
        Err(e) => return bad_request(e.to_string()),
    };
    match state.engine.search(&request).await {
        Ok(results) => Json(query::shape_errors(results)).into_response(),
        Err(e) => engine_failure(e),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn engine_failure(e: EngineError) -> Response {
    tracing::error!(error = %e, "engine query failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": "search engine unavailable" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// WebSocket sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    mode: Option<String>,
    projects: Option<String>,
    levels: Option<String>,
    #[serde(rename = "traceId")]
    trace_id: Option<String>,
    environment: Option<String>,
}

impl WsParams {
    fn filter(&self) -> SubscriberFilter {
        fn split(value: &Option<String>) -> Vec<String> {
            value
                .as_deref()
                .map(|v| {
                    v.split(',')
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        }
        SubscriberFilter {
            projects: split(&self.projects),
            levels: split(&self.levels)
                .into_iter()
                .map(|level| level.to_ascii_lowercase())
                .collect(),
            trace_id: self.trace_id.clone(),
            environment: self.environment.clone(),
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match params.mode.as_deref() {
            Some("subscribe") => subscribe_session(socket, params, state).await,
            _ => ingest_session(socket, state).await,
        }
    })
}

/// Subscribe mode: forward matching records as one text frame each. The
/// session never reads records from the client.
async fn subscribe_session(socket: WebSocket, params: WsParams, state: Arc<AppState>) {
    let subscriber = state.registry.register(params.filter());
    let id = subscriber.id();
    tracing::info!(subscriber = id, filter = ?subscriber.filter(), "subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut forward = {
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move {
            while let Some(payload) = subscriber.next().await {
                if ws_tx
                    .send(Message::Text(payload.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Buffer closed: graceful shutdown or force-close of a slow
            // consumer. Say goodbye with a normal close frame.
            let _ = ws_tx.send(Message::Close(None)).await;
        })
    };

    tokio::select! {
        _ = &mut forward => {}
        _ = async {
            while let Some(Ok(frame)) = ws_rx.next().await {
                if matches!(frame, Message::Close(_)) {
                    break;
                }
            }
        } => {}
    }

    state.registry.deregister(id);
    forward.abort();
    tracing::info!(subscriber = id, dropped = subscriber.dropped(), "subscriber disconnected");
}

/// Ingest mode: every text frame is a record or an array of records. An
/// invalid frame is logged and skipped; the session stays open.
async fn ingest_session(socket: WebSocket, state: Arc<AppState>) {
    let mut socket = socket;
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<IngestPayload>(&text) {
                        Ok(payload) => {
                            let summary = state.ingestor.ingest(payload.into_records()).await;
                            if summary.rejected > 0 {
                                tracing::debug!(rejected = summary.rejected, "ws frame partially rejected");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "invalid ingest frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => break,
        }
    }
}

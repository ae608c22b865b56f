//! Axum-based sync server: WebSocket endpoint plus the admin HTTP
//! surface.
//!
//! Routes:
//! - `GET  /ws`          — WebSocket upgrade (`?token=..&device_id=..`)
//! - `GET  /health`      — public status
//! - `GET  /api/files`   — full listing (master token)
//! - `POST /api/token`   — issue a device token (master token)
//! - `GET  /api/devices` — device list, tokens redacted (master token)

pub mod coordinator;
pub mod hub;
pub mod session;

use crate::auth::{AuthGate, Identity};
use crate::config::Config;
use crate::protocol::MAX_FRAME_BYTES;
use crate::server::coordinator::{Inbound, SyncCoordinator};
use crate::server::hub::{ConnectionHub, Fanout};
use crate::storage::tombstones::TombstoneRegistry;
use crate::storage::ContentStore;
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;

/// Maximum admin HTTP request body (64 KiB).
const MAX_BODY_SIZE: usize = 65_536;

/// Tombstone garbage collection cadence.
const TOMBSTONE_GC_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Shared state for all handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<ContentStore>,
    auth: Arc<AuthGate>,
    hub: Arc<ConnectionHub>,
    inbound: Arc<dyn Inbound>,
    storage_path: String,
}

/// Build the component graph and serve until SIGINT/SIGTERM.
pub async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(
        ContentStore::open(&config.storage.path, config.sync.max_file_size_mb)
            .with_context(|| format!("initializing storage at {}", config.storage.path.display()))?,
    );
    let tombstones = Arc::new(TombstoneRegistry::load(store.root()));
    let auth = Arc::new(AuthGate::new(config.auth.master_token.clone()));
    let hub = Arc::new(ConnectionHub::new());

    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&tombstones),
        Arc::clone(&hub) as Arc<dyn Fanout>,
        config.sync.conflict_resolution,
        config.sync.reject_empty_overwrite,
    ));

    // Periodic tombstone sweep.
    let tombstones_for_gc = Arc::clone(&tombstones);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOMBSTONE_GC_INTERVAL);
        loop {
            interval.tick().await;
            tombstones_for_gc.gc();
        }
    });

    let state = AppState {
        store,
        auth,
        hub,
        inbound: coordinator,
        storage_path: config.storage.path.display().to_string(),
    };

    let app = Router::new()
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .route("/api/files", get(handle_list_files))
        .route("/api/token", post(handle_issue_token))
        .route("/api/devices", get(handle_list_devices))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    if config.server.tls.enabled {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server.tls.cert,
            &config.server.tls.key,
        )
        .await
        .context("loading TLS material")?;

        tracing::info!(%addr, "listening (TLS)");
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        tracing::info!(%addr, "listening (TLS disabled)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

// ── WebSocket handshake ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    device_id: Option<String>,
}

/// GET /ws — authenticate, resolve the device identity, upgrade.
async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = match state.auth.validate(&query.token) {
        // A device token pins the identity; the query parameter is
        // ignored in its favor.
        Some(Identity::Device(id)) => id,
        Some(Identity::Master) => match query.device_id.filter(|d| !d.is_empty()) {
            Some(id) => id,
            None => {
                return (StatusCode::BAD_REQUEST, "device_id required").into_response();
            }
        },
        None => {
            tracing::warn!("ws handshake rejected: bad token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let hub = Arc::clone(&state.hub);
    let inbound = Arc::clone(&state.inbound);
    let auth = Arc::clone(&state.auth);

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| session::run_session(socket, device_id, hub, inbound, auth))
}

// ── HTTP surface ─────────────────────────────────────────────────

/// GET /health — always public, leaks no secrets.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "devices": state.hub.connected_devices().len(),
        "storage": state.storage_path,
    }))
}

fn require_master(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if state.auth.is_master(token) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "Unauthorized").into_response())
    }
}

/// GET /api/files — debug listing of the whole tree.
async fn handle_list_files(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_master(&state, &headers) {
        return resp;
    }

    match state.store.list() {
        Ok(files) => Json(files).into_response(),
        Err(e) => {
            tracing::warn!("file listing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "listing failed").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueTokenBody {
    device_id: String,
    #[serde(default)]
    name: String,
}

/// POST /api/token — issue a device token (master only).
async fn handle_issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IssueTokenBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(resp) = require_master(&state, &headers) {
        return resp;
    }

    let Ok(Json(body)) = body else {
        return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
    };
    if body.device_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "device_id is required").into_response();
    }

    let record = state.auth.issue(&body.device_id, &body.name);
    (StatusCode::CREATED, Json(record)).into_response()
}

/// GET /api/devices — device records, tokens redacted (master only).
async fn handle_list_devices(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_master(&state, &headers) {
        return resp;
    }
    Json(state.auth.list_devices()).into_response()
}

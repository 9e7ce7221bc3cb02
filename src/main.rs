mod admin;
mod collaborators;
mod config;
mod coordinator;
mod envelope;
mod error;
mod hub;
mod media;
mod model;
mod names;
mod queue;
mod registry;
mod storage;

use admin::AdminGate;
use axum::extract::{ConnectInfo, Json, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use collaborators::{NullHoldingScreenGenerator, NullLibrary};
use config::Config;
use coordinator::PlaybackCoordinator;
use hub::Hub;
use media::MediaAdapter;
use queue::QueueEngine;
use registry::SessionRegistry;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::Storage;
use sysinfo::System;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    sys: Arc<AsyncMutex<System>>,
    version: String,
    admin_gate: Arc<AdminGate>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;
    let bind = config.bind;

    let storage = Arc::new(
        Storage::open(&config.db_path())
            .map_err(|e| anyhow::anyhow!("failed to open persistence at {:?}: {e}", config.db_path()))?,
    );

    let registry = Arc::new(SessionRegistry::new(Arc::clone(&storage)));
    let queue = Arc::new(QueueEngine::new(Arc::clone(&storage)));
    let media = MediaAdapter::new(config.clone());
    media.start().await;

    let coordinator = PlaybackCoordinator::new(
        Arc::clone(&queue),
        Arc::clone(&media),
        Arc::new(NullHoldingScreenGenerator),
        format!("ws://{bind}"),
        config.countdown_secs,
        config.admin_countdown_secs,
        config.bgm_url.clone(),
    );

    let hub = Hub::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::clone(&coordinator),
        Arc::clone(&media),
        Arc::new(NullLibrary),
    );

    // Every queue mutation and coordinator transition fans out a fresh
    // RoomState; neither callback is invoked while its owner's lock is held
    // (spec §5 "Re-entrancy avoidance"), so calling straight into the Hub
    // here is safe.
    {
        let hub = Arc::clone(&hub);
        queue.set_on_change(move || hub.broadcast_state());
    }
    {
        let hub = Arc::clone(&hub);
        coordinator.set_on_broadcast(move || hub.broadcast_state());
    }
    {
        let hub = Arc::clone(&hub);
        media.on_state_change(move |_state| hub.broadcast_state());
    }
    {
        let coordinator = Arc::clone(&coordinator);
        media.on_track_end(move || {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.on_track_end().await });
        });
    }

    let admin_gate = Arc::new(AdminGate::new(config.admin_pin.clone(), config.admin_token.clone()));

    let state = AppState {
        hub,
        sys: Arc::new(AsyncMutex::new(System::new_all())),
        version: env!("CARGO_PKG_VERSION").to_string(),
        admin_gate,
    };

    let hub_for_shutdown = Arc::clone(&state.hub);
    let app = build_router(state);

    info!("karahub engine starting on ws://{bind}");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    warn!("shutting down: notifying clients, stopping media adapter and closing persistence");
    hub_for_shutdown.shutdown().await;
    media.stop().await;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/system/info", get(system_info))
        .route("/admin/api/v1/status", get(admin_status))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn root() -> &'static str {
    "karahub engine is running. Connect over /ws."
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": state.version }))
}

#[derive(Serialize)]
struct SystemInfo {
    version: String,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    hostname: Option<String>,
}

async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    let arch = std::env::consts::ARCH.to_string();
    let hostname = System::host_name();

    let mut sys = state.sys.lock().await;
    sys.refresh_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let cpu_cores = sys.cpus().len();
    let la = System::load_average();

    Json(SystemInfo {
        version: state.version.clone(),
        arch,
        cpu_model,
        cpu_cores,
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        hostname,
    })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    ws.on_upgrade(move |socket| async move {
        state.hub.handle_socket(socket, Some(addr.ip()), user_agent).await;
    })
}

#[derive(serde::Deserialize)]
struct AdminQuery {
    pin: Option<String>,
}

/// The one admin-gated HTTP surface this core owns (spec §6 "Admin Gate...
/// consulted for HTTP endpoints only"). Every other admin action arrives
/// over the WebSocket and is gated by the bound session's `isAdmin` flag
/// instead (`hub.rs`).
async fn admin_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<AdminQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if !state
        .admin_gate
        .is_authorized(Some(addr.ip()), query.pin.as_deref(), bearer)
    {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(Json(json!({
        "version": state.version,
        "state": state.hub.room_state(),
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("shutdown signal received");
}

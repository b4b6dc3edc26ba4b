//! HTTP surface of the satellite.
//!
//! Routes:
//!   GET    /api/health                → health check
//!   POST   /api/link/heartbeat        → liveness ping from the authority
//!   POST   /api/link/session-started  → session push (JSON `SessionStarted`)
//!   POST   /api/link/session-ended    → session push
//!   POST   /api/toggle                → the wearer's button
//!   GET    /api/status                → display snapshot
//!   DELETE /api/notice                → dismiss the current notice

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use touchline_common::protocol::{routes, HealthResponse, SessionStarted};

use crate::runtime::{Event, SatelliteHandle};
use crate::state::StatusSnapshot;

#[derive(Clone)]
struct AppState {
    handle: SatelliteHandle,
    status: watch::Receiver<StatusSnapshot>,
    start_time: Instant,
}

#[derive(Debug, Serialize)]
struct ToggleReply {
    recording: bool,
}

pub fn router(handle: SatelliteHandle, status: watch::Receiver<StatusSnapshot>) -> Router {
    let state = AppState {
        handle,
        status,
        start_time: Instant::now(),
    };

    Router::new()
        .route(routes::HEALTH, get(health))
        .route(routes::HEARTBEAT, post(heartbeat))
        .route(routes::SESSION_STARTED, post(session_started))
        .route(routes::SESSION_ENDED, post(session_ended))
        .route(routes::TOGGLE, post(toggle))
        .route(routes::STATUS, get(status_snapshot))
        .route(routes::NOTICE, delete(dismiss_notice))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run(
    handle: SatelliteHandle,
    status: watch::Receiver<StatusSnapshot>,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Satellite HTTP server listening on {listen_addr}");

    axum::serve(listener, router(handle, status))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        role: "satellite".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

fn deliver(state: &AppState, event: Event) -> StatusCode {
    match state.handle.post(event) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!("Dropping request: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn heartbeat(State(state): State<AppState>) -> StatusCode {
    deliver(&state, Event::Heartbeat)
}

async fn session_started(
    State(state): State<AppState>,
    Json(body): Json<SessionStarted>,
) -> StatusCode {
    deliver(&state, Event::SessionStarted(body.session_id))
}

async fn session_ended(State(state): State<AppState>) -> StatusCode {
    deliver(&state, Event::SessionEnded)
}

async fn toggle(State(state): State<AppState>) -> Result<Json<ToggleReply>, StatusCode> {
    let recording = state
        .handle
        .toggle()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(ToggleReply { recording }))
}

async fn status_snapshot(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.borrow().clone())
}

async fn dismiss_notice(State(state): State<AppState>) -> StatusCode {
    deliver(&state, Event::DismissNotice)
}

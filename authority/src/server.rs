//! HTTP surface of the authority.
//!
//! Routes:
//!   GET  /api/health          → health check
//!   GET  /api/state           → `{ session_active }`, computed fresh
//!   POST /api/clips           → WAV body, ticket in the query string
//!   POST /api/session/start   → start a session (JSON `StartSessionRequest`)
//!   POST /api/session/stop    → stop the active session
//!   GET  /api/session         → session, link and ingest status

use std::path::PathBuf;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use touchline_common::protocol::{routes, ClipTicket, HealthResponse, StateReply};

use crate::runtime::{AuthorityHandle, SessionStatus};
use crate::session::{SessionError, StartSessionRequest};

/// Ten minutes of 16-bit stereo at 48 kHz, with room to spare.
const MAX_CLIP_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    handle: AuthorityHandle,
    incoming_dir: PathBuf,
    start_time: Instant,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::SessionAlreadyActive(_) | SessionError::NoActiveSession => {
                StatusCode::CONFLICT
            }
            SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(handle: AuthorityHandle, incoming_dir: PathBuf) -> Router {
    let state = AppState {
        handle,
        incoming_dir,
        start_time: Instant::now(),
    };

    Router::new()
        .route(routes::HEALTH, get(health))
        .route(routes::STATE, get(session_state))
        .route(
            routes::CLIPS,
            post(upload_clip).layer(DefaultBodyLimit::max(MAX_CLIP_BYTES)),
        )
        .route(routes::SESSION_START, post(start_session))
        .route(routes::SESSION_STOP, post(stop_session))
        .route(routes::SESSION, get(session_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run(
    handle: AuthorityHandle,
    incoming_dir: PathBuf,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Authority HTTP server listening on {listen_addr}");

    axum::serve(listener, router(handle, incoming_dir))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        role: "authority".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn session_state(State(state): State<AppState>) -> Result<Json<StateReply>, SessionError> {
    Ok(Json(state.handle.state().await?))
}

async fn upload_clip(
    State(state): State<AppState>,
    Query(ticket): Query<ClipTicket>,
    body: Bytes,
) -> Response {
    // Sanitise: the clip id becomes a file name
    let name = &ticket.clip_id;
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    if let Err(e) = tokio::fs::create_dir_all(&state.incoming_dir).await {
        error!("Cannot create {}: {e}", state.incoming_dir.display());
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let path = state.incoming_dir.join(format!("{name}.wav"));
    if let Err(e) = tokio::fs::write(&path, &body).await {
        error!("Cannot write {}: {e}", path.display());
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    info!("Received {name} ({} bytes)", body.len());

    match state.handle.ingest(ticket, Some(path.clone())).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!("Cannot remove rejected upload {}: {rm}", path.display());
            }
            e.into_response()
        }
    }
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, SessionError> {
    let context = state.handle.start_session(request).await?;
    Ok((StatusCode::CREATED, Json(context)))
}

async fn stop_session(State(state): State<AppState>) -> Result<Response, SessionError> {
    Ok(match state.handle.stop_session().await? {
        Some(context) => Json(context).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn session_status(
    State(state): State<AppState>,
) -> Result<Json<SessionStatus>, SessionError> {
    Ok(Json(state.handle.status().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::DateTime;
    use touchline_common::clock::SystemClock;
    use touchline_common::config::Config;
    use touchline_common::memory;
    use touchline_common::protocol::TransferReceipt;

    use crate::archive::{read_index, ArchiveStore};
    use crate::orchestrator::Orchestrator;
    use crate::runtime::{AuthorityRuntime, Timings};
    use crate::transport::MemorySatellite;

    async fn serve(archive: &std::path::Path) -> (String, CancellationToken) {
        let pair = memory::pair(64);
        let runtime = AuthorityRuntime::new(
            Orchestrator::new(ArchiveStore::new(archive)),
            MemorySatellite::new(pair.to_satellite),
            SystemClock,
            Timings::from(&Config::default()),
        );
        let handle = runtime.handle();
        let cancel = CancellationToken::new();
        tokio::spawn(runtime.run(cancel.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(handle, archive.join("incoming"));
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });
        (format!("http://{addr}"), cancel)
    }

    fn start_body() -> StartSessionRequest {
        StartSessionRequest {
            session_id: Some("S1".into()),
            team_id: "U12-blue".into(),
            roster: BTreeSet::new(),
            owner_id: "coach-1".into(),
        }
    }

    fn ticket(clip_id: &str) -> ClipTicket {
        ClipTicket {
            clip_id: clip_id.into(),
            recording_start: DateTime::from_timestamp(1_700_000_010, 0).unwrap(),
            recording_end: DateTime::from_timestamp(1_700_000_025, 0).unwrap(),
            auxiliary_label: "watch".into(),
        }
    }

    async fn upload(base: &str, ticket: &ClipTicket) -> reqwest::Response {
        let mut url = reqwest::Url::parse(&format!("{base}{}", routes::CLIPS)).unwrap();
        url.query_pairs_mut().extend_pairs(ticket.query_pairs());
        reqwest::Client::new()
            .post(url)
            .body(b"RIFF-test".to_vec())
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_start_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let (base, cancel) = serve(tmp.path()).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("{base}{}", routes::SESSION_START))
            .json(&start_body())
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = client
            .post(format!("{base}{}", routes::SESSION_START))
            .json(&start_body())
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let state: StateReply = reqwest::get(format!("{base}{}", routes::STATE))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(state.session_active);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_upload_is_archived_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (base, cancel) = serve(tmp.path()).await;
        reqwest::Client::new()
            .post(format!("{base}{}", routes::SESSION_START))
            .json(&start_body())
            .send()
            .await
            .unwrap();

        let first: TransferReceipt = upload(&base, &ticket("c1")).await.json().await.unwrap();
        assert_eq!(first.artifact_id, "S1/c1");
        let again: TransferReceipt = upload(&base, &ticket("c1")).await.json().await.unwrap();
        assert!(again.duplicate);

        let session_dir = tmp.path().join("S1");
        assert_eq!(std::fs::read(session_dir.join("c1.wav")).unwrap(), b"RIFF-test");
        assert_eq!(read_index(&session_dir).unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(tmp.path().join("incoming")).unwrap().count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_upload_without_session_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (base, cancel) = serve(tmp.path()).await;

        let resp = upload(&base, &ticket("orphan")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(!tmp.path().join("incoming").join("orphan.wav").exists());

        let bad = upload(&base, &ticket("../escape")).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        cancel.cancel();
    }
}

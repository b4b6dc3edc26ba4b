//! Touchline authority – owns the recording session and archives clips.
//!
//! This binary:
//! 1. Reads configuration from `touchline.conf`
//! 2. Registers on mDNS and looks for the satellite
//! 3. Runs the session actor and an axum server for the coach's UI and
//!    the satellite's uploads.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use touchline_authority::archive::ArchiveStore;
use touchline_authority::orchestrator::Orchestrator;
use touchline_authority::runtime::{AuthorityRuntime, Timings};
use touchline_authority::server;
use touchline_authority::transport::HttpSatellite;
use touchline_common::clock::SystemClock;
use touchline_common::config::{self, Config};
use touchline_common::discovery::{self, Role};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Touchline authority starting (listen={}, archive={})",
        config.authority_listen_addr,
        config.archive_dir.display()
    );

    std::fs::create_dir_all(config.incoming_dir())
        .context("Cannot create archive directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            cancel.cancel();
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── discovery ────────────────────────────────────────────────────
    let (registration, satellite_url) = if std::env::var_os(discovery::DISABLE_ENV).is_some() {
        info!("mDNS disabled; using {}", config.satellite_url);
        (None, config.satellite_url.clone())
    } else {
        let port = config::listen_port(&config.authority_listen_addr);
        let fallback = config.satellite_url.clone();
        tokio::task::spawn_blocking(move || {
            let registration = match discovery::register(Role::Authority, port) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("mDNS registration failed: {e:#}");
                    None
                }
            };
            let url =
                discovery::resolve_peer_url(registration.as_ref(), DISCOVERY_TIMEOUT, &fallback);
            (registration, url)
        })
        .await
        .context("Discovery task failed")?
    };
    info!("Satellite at {satellite_url}");

    // ── actor ────────────────────────────────────────────────────────
    let runtime = AuthorityRuntime::new(
        Orchestrator::new(ArchiveStore::new(&config.archive_dir)),
        HttpSatellite::new(&satellite_url, PUSH_TIMEOUT)?,
        SystemClock,
        Timings::from(&config),
    );

    // ── start HTTP server ────────────────────────────────────────────
    let handle = runtime.handle();
    let incoming_dir = config.incoming_dir();
    let listen_addr = config.authority_listen_addr.clone();
    let shutdown = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(handle, incoming_dir, &listen_addr, shutdown.clone()).await {
            tracing::error!("HTTP server error: {e:#}");
            shutdown.cancel();
        }
    });

    runtime.run(cancel).await;
    let _ = server_handle.await;

    if let Some(registration) = registration {
        registration.shutdown();
    }
    info!("Touchline authority stopped");
    Ok(())
}

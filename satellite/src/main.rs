//! Touchline satellite – records clips on the wearable and hands them to
//! the phone.
//!
//! This binary:
//! 1. Reads configuration from `touchline.conf`
//! 2. Registers on mDNS and looks for the authority
//! 3. Runs the satellite actor and an axum server for link pushes and
//!    the wearer's button.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use touchline_common::clock::SystemClock;
use touchline_common::config::{self, Config};
use touchline_common::discovery::{self, Role};
use touchline_satellite::runtime::{SatelliteRuntime, Timings};
use touchline_satellite::satellite::Satellite;
use touchline_satellite::transfer::TransferQueue;
use touchline_satellite::transport::HttpAuthority;
use touchline_satellite::watchdog::Watchdog;
use touchline_satellite::{capture, server};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

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
        "Touchline satellite starting (listen={}, device={:?})",
        config.satellite_listen_addr, config.capture_device
    );

    std::fs::create_dir_all(&config.scratch_dir)
        .context("Cannot create scratch directory")?;

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
    let (registration, authority_url) = if std::env::var_os(discovery::DISABLE_ENV).is_some() {
        info!("mDNS disabled; using {}", config.authority_url);
        (None, config.authority_url.clone())
    } else {
        let port = config::listen_port(&config.satellite_listen_addr);
        let fallback = config.authority_url.clone();
        tokio::task::spawn_blocking(move || {
            let registration = match discovery::register(Role::Satellite, port) {
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
    info!("Authority at {authority_url}");

    // ── actor ────────────────────────────────────────────────────────
    let core = Satellite::new(
        capture::from_config(&config),
        TransferQueue::new(
            &config.scratch_dir,
            &config.auxiliary_label,
            config.transfer_retry_capacity,
        ),
        Watchdog::new(config.watchdog_timeout),
    );
    let transport = HttpAuthority::new(&authority_url, UPLOAD_TIMEOUT, config.probe_interval)?;
    let runtime = SatelliteRuntime::new(core, transport, SystemClock, Timings::from(&config));

    // ── start HTTP server ────────────────────────────────────────────
    let handle = runtime.handle();
    let status = runtime.status();
    let listen_addr = config.satellite_listen_addr.clone();
    let shutdown = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(handle, status, &listen_addr, shutdown.clone()).await {
            tracing::error!("HTTP server error: {e:#}");
            shutdown.cancel();
        }
    });

    runtime.run(cancel).await;
    let _ = server_handle.await;

    if let Some(registration) = registration {
        registration.shutdown();
    }
    info!("Touchline satellite stopped");
    Ok(())
}

//! Authority → satellite transports.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

use touchline_common::link::LinkError;
use touchline_common::memory::{MemoryLink, ToAuthority, ToSatellite};
use touchline_common::protocol::{routes, SessionStarted};

use crate::runtime::AuthorityHandle;

pub trait SatelliteTransport: Clone + Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn heartbeat(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn notify_session_started(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn notify_session_ended(&self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

// ── HTTP ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpSatellite {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSatellite {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, route: &str, body: Option<&SessionStarted>) -> Result<(), LinkError> {
        let mut req = self.client.post(format!("{}{route}", self.base_url));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| LinkError::Unreachable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LinkError::Rejected(format!(
                "POST {route} returned {}",
                resp.status()
            )))
        }
    }
}

impl SatelliteTransport for HttpSatellite {
    async fn probe(&self) -> Result<(), LinkError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, routes::HEALTH))
            .send()
            .await
            .map_err(|e| LinkError::Unreachable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LinkError::Unreachable(format!("health returned {}", resp.status())))
        }
    }

    async fn heartbeat(&self) -> Result<(), LinkError> {
        self.post(routes::HEARTBEAT, None).await
    }

    async fn notify_session_started(&self, session_id: &str) -> Result<(), LinkError> {
        let body = SessionStarted {
            session_id: session_id.to_string(),
        };
        self.post(routes::SESSION_STARTED, Some(&body)).await
    }

    async fn notify_session_ended(&self) -> Result<(), LinkError> {
        self.post(routes::SESSION_ENDED, None).await
    }
}

// ── in-memory ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemorySatellite {
    link: MemoryLink<ToSatellite>,
}

impl MemorySatellite {
    pub fn new(link: MemoryLink<ToSatellite>) -> Self {
        Self { link }
    }
}

impl SatelliteTransport for MemorySatellite {
    async fn probe(&self) -> Result<(), LinkError> {
        if self.link.is_reachable() {
            Ok(())
        } else {
            Err(LinkError::Unreachable("in-memory link down".into()))
        }
    }

    async fn heartbeat(&self) -> Result<(), LinkError> {
        self.link.send(ToSatellite::Heartbeat).await
    }

    async fn notify_session_started(&self, session_id: &str) -> Result<(), LinkError> {
        self.link
            .send(ToSatellite::SessionStarted(SessionStarted {
                session_id: session_id.to_string(),
            }))
            .await
    }

    async fn notify_session_ended(&self) -> Result<(), LinkError> {
        self.link.send(ToSatellite::SessionEnded).await
    }
}

/// Serve satellite requests arriving on an in-memory link.
pub fn spawn_memory_inbox(
    mut inbox: mpsc::Receiver<ToAuthority>,
    handle: AuthorityHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            match msg {
                ToAuthority::StateRequest { reply } => match handle.state().await {
                    Ok(state) => {
                        let _ = reply.send(state);
                    }
                    Err(_) => break,
                },
                ToAuthority::ClipTransfer { ticket, reply } => {
                    debug!("Clip {} arrived over the in-memory link", ticket.clip_id);
                    let result = handle
                        .ingest(ticket, None)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
            }
        }
    })
}

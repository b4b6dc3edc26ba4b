//! Satellite → authority transports.
//!
//! [`HttpAuthority`] uploads the audio file together with its ticket.
//! [`MemoryAuthority`] is for environments without a file-transfer
//! primitive and sends the ticket alone.  One of them is chosen at startup.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use touchline_common::link::LinkError;
use touchline_common::memory::{MemoryLink, ToAuthority, ToSatellite};
use touchline_common::protocol::{routes, StateReply, TransferReceipt};

use crate::runtime::{Event, SatelliteHandle};
use crate::transfer::TransferTicket;

pub trait AuthorityTransport: Clone + Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn request_state(&self) -> impl Future<Output = Result<StateReply, LinkError>> + Send;

    /// Resolves once the authority has ingested the clip.
    fn submit_clip(
        &self,
        ticket: &TransferTicket,
    ) -> impl Future<Output = Result<TransferReceipt, LinkError>> + Send;
}

// ── HTTP ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    /// Bounds probes and state requests; uploads use the client default.
    control_timeout: Duration,
}

impl HttpAuthority {
    pub fn new(
        base_url: &str,
        upload_timeout: Duration,
        control_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(upload_timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            control_timeout,
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base_url)
    }
}

fn unreachable_err(e: reqwest::Error) -> LinkError {
    LinkError::Unreachable(e.to_string())
}

impl AuthorityTransport for HttpAuthority {
    async fn probe(&self) -> Result<(), LinkError> {
        let resp = self
            .client
            .get(self.url(routes::HEALTH))
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(unreachable_err)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LinkError::Unreachable(format!("health returned {}", resp.status())))
        }
    }

    async fn request_state(&self) -> Result<StateReply, LinkError> {
        let resp = self
            .client
            .get(self.url(routes::STATE))
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(unreachable_err)?;
        if !resp.status().is_success() {
            return Err(LinkError::Rejected(format!(
                "GET {} returned {}",
                routes::STATE,
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| LinkError::Rejected(e.to_string()))
    }

    async fn submit_clip(&self, ticket: &TransferTicket) -> Result<TransferReceipt, LinkError> {
        let bytes = tokio::fs::read(&ticket.clip.local_file)
            .await
            .map_err(|e| LinkError::Payload(format!("{}: {e}", ticket.clip.local_file.display())))?;

        let mut url = reqwest::Url::parse(&self.url(routes::CLIPS))
            .map_err(|e| LinkError::Rejected(e.to_string()))?;
        url.query_pairs_mut().extend_pairs(ticket.meta.query_pairs());

        debug!("Uploading {} ({} bytes)", ticket.clip_id(), bytes.len());
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(bytes)
            .send()
            .await
            .map_err(unreachable_err)?;
        if !resp.status().is_success() {
            return Err(LinkError::Rejected(format!(
                "POST {} returned {}",
                routes::CLIPS,
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| LinkError::Rejected(e.to_string()))
    }
}

// ── in-memory ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryAuthority {
    link: MemoryLink<ToAuthority>,
}

impl MemoryAuthority {
    pub fn new(link: MemoryLink<ToAuthority>) -> Self {
        Self { link }
    }
}

impl AuthorityTransport for MemoryAuthority {
    async fn probe(&self) -> Result<(), LinkError> {
        if self.link.is_reachable() {
            Ok(())
        } else {
            Err(LinkError::Unreachable("in-memory link down".into()))
        }
    }

    async fn request_state(&self) -> Result<StateReply, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.link.send(ToAuthority::StateRequest { reply }).await?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    async fn submit_clip(&self, ticket: &TransferTicket) -> Result<TransferReceipt, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.link
            .send(ToAuthority::ClipTransfer {
                ticket: ticket.meta.clone(),
                reply,
            })
            .await?;
        rx.await
            .map_err(|_| LinkError::Closed)?
            .map_err(LinkError::Rejected)
    }
}

/// Feed authority pushes from an in-memory link into the satellite.
pub fn spawn_memory_inbox(
    mut inbox: mpsc::Receiver<ToSatellite>,
    handle: SatelliteHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let event = match msg {
                ToSatellite::Heartbeat => Event::Heartbeat,
                ToSatellite::SessionStarted(s) => Event::SessionStarted(s.session_id),
                ToSatellite::SessionEnded => Event::SessionEnded,
            };
            if handle.post(event).is_err() {
                break;
            }
        }
    })
}

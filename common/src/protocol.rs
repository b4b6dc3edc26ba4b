//! Wire types exchanged between the authority (phone) and the satellite
//! (wearable).
//!
//! The same shapes travel over HTTP (JSON bodies and query strings) and over
//! the in-process channel in [`crate::memory`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one captured clip, unique per satellite process.
pub type ClipId = String;

/// Route table shared by both servers and both HTTP clients.
pub mod routes {
    pub const HEALTH: &str = "/api/health";

    // ── served by the authority ──────────────────────────────────────
    pub const STATE: &str = "/api/state";
    pub const CLIPS: &str = "/api/clips";
    pub const SESSION: &str = "/api/session";
    pub const SESSION_START: &str = "/api/session/start";
    pub const SESSION_STOP: &str = "/api/session/stop";

    // ── served by the satellite ──────────────────────────────────────
    pub const HEARTBEAT: &str = "/api/link/heartbeat";
    pub const SESSION_STARTED: &str = "/api/link/session-started";
    pub const SESSION_ENDED: &str = "/api/link/session-ended";
    pub const TOGGLE: &str = "/api/toggle";
    pub const STATUS: &str = "/api/status";
    pub const NOTICE: &str = "/api/notice";
}

/// Reply to a satellite's state request.  Always computed fresh by the
/// authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    pub session_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Authority → satellite: a recording session has begun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: String,
}

/// Metadata sent alongside a clip's audio payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipTicket {
    pub clip_id: ClipId,
    pub recording_start: DateTime<Utc>,
    pub recording_end: DateTime<Utc>,
    #[serde(default)]
    pub auxiliary_label: String,
}

impl ClipTicket {
    /// Query-string pairs for the HTTP clip upload.
    pub fn query_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("clip_id", self.clip_id.clone()),
            ("recording_start", wire_timestamp(&self.recording_start)),
            ("recording_end", wire_timestamp(&self.recording_end)),
            ("auxiliary_label", self.auxiliary_label.clone()),
        ]
    }
}

/// Acknowledgment of one delivered clip.  Receiving it is what allows the
/// satellite to delete its local copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub clip_id: ClipId,
    pub artifact_id: String,
    /// The clip had already been ingested; nothing new was written.
    #[serde(default)]
    pub duplicate: bool,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub role: String,
    pub uptime_secs: u64,
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn wire_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

//! The satellite's view of the link and what it shows the wearer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use touchline_common::link::LinkPhase;
use touchline_common::protocol::ClipId;

/// Locally held replica of the session state.  `session_active` is a cache
/// of the authority's ground truth, refreshed by reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub session_active: bool,
    pub session_id: Option<String>,
    pub reachable: bool,
}

/// Why an active session was stopped on the satellite's own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// No heartbeat within the watchdog window.
    HeartbeatTimeout,
    /// The link reported the peer gone.
    Disconnected,
}

/// User-visible, non-fatal conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Notice {
    /// "Connection lost, session stopped."
    ConnectionLost { reason: LossReason },
    /// The microphone could not be opened.
    CaptureUnavailable { message: String },
    /// A clip could not be handed to the authority and is gone.
    TransferDropped { clip_id: ClipId },
}

/// Polled snapshot behind the wearable's display.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_active: bool,
    pub session_id: Option<String>,
    pub reachable: bool,
    pub link: LinkPhase,
    pub recording: bool,
    /// Seconds since the current capture started.
    pub recording_secs: Option<f64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub outstanding_transfers: usize,
    pub notice: Option<Notice>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            session_active: false,
            session_id: None,
            reachable: false,
            link: LinkPhase::Inactive,
            recording: false,
            recording_secs: None,
            last_heartbeat_at: None,
            outstanding_transfers: 0,
            notice: None,
        }
    }
}

//! The authority's session record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ParticipantId = String;

/// The one active session on an authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub team_id: String,
    pub started_at: DateTime<Utc>,
    pub roster: BTreeSet<ParticipantId>,
    pub owner_id: String,
}

/// Body of `POST /api/session/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Generated from the start time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub team_id: String,
    #[serde(default)]
    pub roster: BTreeSet<ParticipantId>,
    pub owner_id: String,
}

impl StartSessionRequest {
    pub fn into_context(self, now: DateTime<Utc>) -> SessionContext {
        let session_id = self
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("session-{}", now.format("%Y%m%dT%H%M%S")));
        SessionContext {
            session_id,
            team_id: self.team_id,
            started_at: now,
            roster: self.roster,
            owner_id: self.owner_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already active")]
    SessionAlreadyActive(String),
    #[error("no active session")]
    NoActiveSession,
    #[error("cannot archive clip: {0}")]
    Store(String),
    #[error("authority is shutting down")]
    Closed,
}

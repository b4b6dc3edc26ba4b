//! Session orchestrator: the authority's state holder.
//!
//! Owns the single [`SessionContext`] and the persistence collaborator.
//! Link side effects come out as [`Command`]s, mirroring the satellite.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use touchline_common::protocol::{ClipId, ClipTicket, StateReply, TransferReceipt};

use crate::archive::{ClipStore, IngestRecord};
use crate::session::{SessionContext, SessionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartHeartbeat,
    StopHeartbeat,
    NotifySessionStarted(String),
    NotifySessionEnded,
}

pub struct Orchestrator<S> {
    store: S,
    context: Option<SessionContext>,
    /// The last ended session, so clips stopped by its end still land in it.
    previous: Option<SessionContext>,
    delivered: HashMap<ClipId, TransferReceipt>,
    commands: Vec<Command>,
}

impl<S: ClipStore> Orchestrator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            context: None,
            previous: None,
            delivered: HashMap::new(),
            commands: Vec::new(),
        }
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn ingested_count(&self) -> usize {
        self.delivered.len()
    }

    /// Rejects a second session; the running one is left untouched.
    pub fn start_session(&mut self, context: SessionContext) -> Result<(), SessionError> {
        if let Some(active) = &self.context {
            warn!(
                "Session {} already active; refusing {}",
                active.session_id, context.session_id
            );
            return Err(SessionError::SessionAlreadyActive(active.session_id.clone()));
        }
        info!(
            "Session {} started (team={}, roster={})",
            context.session_id,
            context.team_id,
            context.roster.len()
        );
        self.commands.push(Command::StartHeartbeat);
        self.commands
            .push(Command::NotifySessionStarted(context.session_id.clone()));
        self.context = Some(context);
        Ok(())
    }

    /// Returns the context that was ended, if any.
    pub fn stop_session(&mut self) -> Option<SessionContext> {
        let Some(context) = self.context.take() else {
            warn!("No active session; stop ignored");
            return None;
        };
        info!("Session {} stopped", context.session_id);
        self.commands.push(Command::StopHeartbeat);
        self.commands.push(Command::NotifySessionEnded);
        self.previous = Some(context.clone());
        Some(context)
    }

    pub fn reply_to_state_request(&self) -> StateReply {
        StateReply {
            session_active: self.context.is_some(),
            session_id: self.context.as_ref().map(|c| c.session_id.clone()),
        }
    }

    /// File a delivered clip.  A clip id seen before returns its original
    /// receipt and writes nothing; the redundant upload is discarded.
    pub fn ingest(
        &mut self,
        ticket: &ClipTicket,
        file: Option<&Path>,
    ) -> Result<TransferReceipt, SessionError> {
        if let Some(receipt) = self.delivered.get(&ticket.clip_id) {
            info!("Clip {} already ingested as {}", ticket.clip_id, receipt.artifact_id);
            if let Some(f) = file {
                if let Err(e) = std::fs::remove_file(f) {
                    debug!("Cannot remove duplicate upload {}: {e}", f.display());
                }
            }
            return Ok(TransferReceipt {
                duplicate: true,
                ..receipt.clone()
            });
        }

        let context = self
            .context
            .as_ref()
            .or(self.previous.as_ref())
            .ok_or(SessionError::NoActiveSession)?;
        if self.context.is_none() {
            debug!(
                "Clip {} arrived after session end; filing under {}",
                ticket.clip_id, context.session_id
            );
        }

        let record = IngestRecord {
            session_id: context.session_id.clone(),
            team_id: context.team_id.clone(),
            clip_id: ticket.clip_id.clone(),
            recording_start: ticket.recording_start,
            recording_end: ticket.recording_end,
            offset_start_secs: offset_secs(context.started_at, ticket.recording_start),
            offset_end_secs: offset_secs(context.started_at, ticket.recording_end),
            auxiliary_label: ticket.auxiliary_label.clone(),
            file: file.map(Path::to_path_buf),
        };
        let artifact_id = self
            .store
            .ingest_clip(&record)
            .map_err(|e| SessionError::Store(format!("{e:#}")))?;

        let receipt = TransferReceipt {
            clip_id: ticket.clip_id.clone(),
            artifact_id,
            duplicate: false,
        };
        self.delivered.insert(ticket.clip_id.clone(), receipt.clone());
        Ok(receipt)
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

fn offset_secs(origin: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - origin).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingStore {
        records: Vec<IngestRecord>,
    }

    impl ClipStore for RecordingStore {
        fn ingest_clip(&mut self, record: &IngestRecord) -> anyhow::Result<String> {
            self.records.push(record.clone());
            Ok(format!("{}/{}", record.session_id, record.clip_id))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn context(id: &str) -> SessionContext {
        SessionContext {
            session_id: id.into(),
            team_id: "U12-blue".into(),
            started_at: t(0),
            roster: BTreeSet::new(),
            owner_id: "coach-1".into(),
        }
    }

    fn ticket(clip_id: &str, start: i64, end: i64) -> ClipTicket {
        ClipTicket {
            clip_id: clip_id.into(),
            recording_start: t(start),
            recording_end: t(end),
            auxiliary_label: "watch".into(),
        }
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        orch.start_session(context("S1")).unwrap();
        assert_eq!(
            orch.take_commands(),
            vec![
                Command::StartHeartbeat,
                Command::NotifySessionStarted("S1".into())
            ]
        );

        let err = orch.start_session(context("S2")).unwrap_err();
        assert!(matches!(err, SessionError::SessionAlreadyActive(ref id) if id == "S1"));
        assert_eq!(orch.context().unwrap().session_id, "S1");
        assert!(orch.take_commands().is_empty());
    }

    #[test]
    fn test_state_reply_is_fresh() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        assert!(!orch.reply_to_state_request().session_active);
        orch.start_session(context("S1")).unwrap();
        let reply = orch.reply_to_state_request();
        assert!(reply.session_active);
        assert_eq!(reply.session_id.as_deref(), Some("S1"));
        orch.stop_session();
        assert_eq!(
            orch.reply_to_state_request(),
            StateReply {
                session_active: false,
                session_id: None
            }
        );
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        assert!(orch.stop_session().is_none());
        assert!(orch.take_commands().is_empty());
    }

    #[test]
    fn test_stop_cancels_heartbeat_then_notifies() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        orch.start_session(context("S1")).unwrap();
        orch.take_commands();
        assert_eq!(orch.stop_session().unwrap().session_id, "S1");
        assert_eq!(
            orch.take_commands(),
            vec![Command::StopHeartbeat, Command::NotifySessionEnded]
        );
        assert!(orch.context().is_none());
    }

    #[test]
    fn test_ingest_offsets_relative_to_session_start() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        orch.start_session(context("S1")).unwrap();

        let receipt = orch.ingest(&ticket("c1", 10, 25), None).unwrap();
        assert_eq!(receipt.artifact_id, "S1/c1");
        assert!(!receipt.duplicate);

        let rec = &orch.store.records[0];
        assert_eq!(rec.offset_start_secs, 10.0);
        assert_eq!(rec.offset_end_secs, 25.0);
        assert_eq!(rec.team_id, "U12-blue");
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dup = tmp.path().join("dup.wav");
        std::fs::write(&dup, b"RIFF").unwrap();

        let mut orch = Orchestrator::new(RecordingStore::default());
        orch.start_session(context("S1")).unwrap();
        let first = orch.ingest(&ticket("c1", 1, 2), None).unwrap();
        let again = orch.ingest(&ticket("c1", 1, 2), Some(&dup)).unwrap();

        assert_eq!(again.artifact_id, first.artifact_id);
        assert!(again.duplicate);
        assert_eq!(orch.store.records.len(), 1);
        assert_eq!(orch.ingested_count(), 1);
        assert!(!dup.exists());
    }

    #[test]
    fn test_late_clip_files_under_ended_session() {
        let mut orch = Orchestrator::new(RecordingStore::default());
        assert!(matches!(
            orch.ingest(&ticket("early", 0, 1), None),
            Err(SessionError::NoActiveSession)
        ));

        orch.start_session(context("S1")).unwrap();
        orch.stop_session();
        let receipt = orch.ingest(&ticket("late", 40, 41), None).unwrap();
        assert_eq!(receipt.artifact_id, "S1/late");
    }
}

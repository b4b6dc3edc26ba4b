//! The satellite's state holder.
//!
//! Owns the session cache, the watchdog, the capture state machine and the
//! transfer queue.  Every method is synchronous and takes the current time;
//! side effects on the link come out as [`Command`]s for the runtime to
//! carry out.  This keeps the whole protocol testable without a transport.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use touchline_common::protocol::{StateReply, TransferReceipt};

use crate::recorder::{CaptureDevice, CaptureError, CaptureMachine};
use crate::state::{ConnectivityState, LossReason, Notice, StatusSnapshot};
use crate::transfer::{TransferQueue, TransferTicket};
use crate::watchdog::{Verdict, Watchdog};

/// Work the runtime performs on the satellite's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the authority for ground truth.
    RequestState,
    Submit(TransferTicket),
    StartWatchdog,
    StopWatchdog,
}

pub struct Satellite<D> {
    state: ConnectivityState,
    watchdog: Watchdog,
    capture: CaptureMachine<D>,
    transfers: TransferQueue,
    notice: Option<Notice>,
    commands: Vec<Command>,
}

impl<D: CaptureDevice> Satellite<D> {
    pub fn new(device: D, transfers: TransferQueue, watchdog: Watchdog) -> Self {
        Self {
            state: ConnectivityState::default(),
            watchdog,
            capture: CaptureMachine::new(device),
            transfers,
            notice: None,
            commands: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectivityState {
        &self.state
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// Process launch: leftovers from a previous run are not resumed, and
    /// the cached flag is refreshed before anyone trusts it.
    pub fn launch(&mut self) {
        match self.transfers.cleanup_if_safe(false) {
            Ok(true) => info!("Discarded scratch clips from a previous run"),
            Ok(false) => {}
            Err(e) => warn!("Cannot purge scratch at launch: {e:#}"),
        }
        self.commands.push(Command::RequestState);
    }

    // ── authority → satellite ────────────────────────────────────────

    pub fn on_session_started(&mut self, session_id: &str, now: DateTime<Utc>) {
        if self.state.session_active && self.state.session_id.as_deref() == Some(session_id) {
            debug!("Session {session_id} already active");
            return;
        }
        info!("Session {session_id} started");
        self.state.session_active = true;
        self.state.session_id = Some(session_id.to_string());
        self.watchdog.start_monitoring(now);
        self.commands.push(Command::StartWatchdog);
    }

    pub fn on_session_ended(&mut self, now: DateTime<Utc>) {
        if !self.state.session_active {
            debug!("Session end received while inactive");
            return;
        }
        info!(
            "Session {} ended",
            self.state.session_id.as_deref().unwrap_or("?")
        );
        self.end_session(now);
    }

    /// Liveness only: never touches `session_active`.
    pub fn on_heartbeat(&mut self, now: DateTime<Utc>) {
        self.watchdog.on_heartbeat_received(now);
    }

    // ── local timers ─────────────────────────────────────────────────

    pub fn on_watchdog_tick(&mut self, now: DateTime<Utc>) {
        if !self.state.session_active {
            return;
        }
        if let Verdict::Expired { silent_for } = self.watchdog.check(now) {
            warn!("No heartbeat for {:.1}s", silent_for.as_secs_f64());
            self.force_stop(now, LossReason::HeartbeatTimeout);
        }
    }

    // ── link ─────────────────────────────────────────────────────────

    pub fn on_reachability_changed(&mut self, reachable: bool, now: DateTime<Utc>) {
        let was_reachable = self.state.reachable;
        self.state.reachable = reachable;

        // The queue must see the link as down before the flushed clip lands.
        self.transfers.set_reachable(reachable);
        if !reachable && self.state.session_active {
            self.force_stop(now, LossReason::Disconnected);
        }
        self.drain_transfers();

        if reachable && !was_reachable {
            info!("Link regained; reconciling session state");
            self.commands.push(Command::RequestState);
        }
    }

    /// Reconciliation: the reply is ground truth, whatever was cached.
    pub fn on_state_reply(&mut self, reply: StateReply, now: DateTime<Utc>) {
        match (reply.session_active, self.state.session_active) {
            (true, false) => {
                let id = reply
                    .session_id
                    .or_else(|| self.state.session_id.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                info!("Reconciled: authority reports session {id} active");
                self.on_session_started(&id, now);
            }
            (false, true) => {
                info!("Reconciled: authority reports no active session");
                self.end_session(now);
            }
            (true, true) => {
                if let Some(id) = reply.session_id {
                    if self.state.session_id.as_deref() != Some(id.as_str()) {
                        info!("Reconciled: session changed to {id}");
                        self.end_session(now);
                        self.on_session_started(&id, now);
                    }
                }
            }
            (false, false) => debug!("Reconciled: no session, nothing to do"),
        }
    }

    pub fn on_transfer_completed(&mut self, receipt: &TransferReceipt) {
        if let Err(e) = self.transfers.complete(&receipt.clip_id) {
            error!("{e:#}");
        }
        self.try_cleanup();
    }

    pub fn on_transfer_failed(&mut self, clip_id: &str, reason: &str) {
        self.transfers.fail(clip_id, reason);
        self.drain_transfers();
        self.try_cleanup();
    }

    // ── wearer ───────────────────────────────────────────────────────

    /// The single hardware button.  Returns whether a capture is running
    /// afterwards.
    pub fn toggle_recording(&mut self, now: DateTime<Utc>) -> bool {
        if !self.capture.is_recording() && !self.state.session_active {
            warn!("No active session; capture not started");
            return false;
        }
        if let Err(e) = self.capture.toggle(now, &mut self.transfers) {
            self.report_capture_error(e);
        }
        self.drain_transfers();
        self.capture.is_recording()
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        StatusSnapshot {
            session_active: self.state.session_active,
            session_id: self.state.session_id.clone(),
            reachable: self.state.reachable,
            recording: self.capture.is_recording(),
            recording_secs: self.capture.elapsed(now).map(|d| d.as_secs_f64()),
            last_heartbeat_at: self.watchdog.last_heartbeat_at(),
            outstanding_transfers: self.transfers.outstanding_len(),
            notice: self.notice.clone(),
            ..StatusSnapshot::default()
        }
    }

    // ── internals ────────────────────────────────────────────────────

    fn force_stop(&mut self, now: DateTime<Utc>, reason: LossReason) {
        warn!("Connection lost ({reason:?}); stopping session");
        self.end_session(now);
        self.notice = Some(Notice::ConnectionLost { reason });
    }

    /// Flush any running capture, clear the flag, cancel monitoring.
    fn end_session(&mut self, now: DateTime<Utc>) {
        if self.capture.is_recording() {
            if let Err(e) = self.capture.stop(now, &mut self.transfers) {
                self.report_capture_error(e);
            }
            self.drain_transfers();
        }
        self.state.session_active = false;
        if self.watchdog.is_monitoring() {
            self.watchdog.stop_monitoring();
            self.commands.push(Command::StopWatchdog);
        }
    }

    fn drain_transfers(&mut self) {
        for ticket in self.transfers.take_submissions() {
            self.commands.push(Command::Submit(ticket));
        }
        if let Some(clip_id) = self.transfers.take_dropped().pop() {
            self.notice = Some(Notice::TransferDropped { clip_id });
        }
    }

    fn try_cleanup(&mut self) {
        if let Err(e) = self.transfers.cleanup_if_safe(self.capture.is_recording()) {
            warn!("{e:#}");
        }
    }

    fn report_capture_error(&mut self, e: CaptureError) {
        error!("Capture failed: {e}");
        self.notice = Some(Notice::CaptureUnavailable {
            message: e.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::tests::{t, FakeDevice};
    use std::path::Path;

    fn satellite(scratch: &Path) -> Satellite<FakeDevice> {
        Satellite::new(
            FakeDevice::new(scratch),
            TransferQueue::new(scratch, "watch", 0),
            Watchdog::default(),
        )
    }

    fn reply(active: bool, id: Option<&str>) -> StateReply {
        StateReply {
            session_active: active,
            session_id: id.map(str::to_string),
        }
    }

    fn submissions(commands: &[Command]) -> Vec<TransferTicket> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Submit(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_launch_requests_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.launch();
        assert_eq!(sat.take_commands(), vec![Command::RequestState]);
    }

    #[test]
    fn test_reconnect_reconciles_against_authority() {
        let tmp = tempfile::tempdir().unwrap();
        // (cached flag, authority truth)
        for (cached, truth) in [(false, false), (false, true), (true, false), (true, true)] {
            let mut sat = satellite(tmp.path());
            if cached {
                // Learned while the probe still considered the link down.
                sat.on_session_started("S0", t(0.0));
            }
            sat.take_commands();

            sat.on_reachability_changed(true, t(2.0));
            assert!(sat.take_commands().contains(&Command::RequestState));

            sat.on_state_reply(reply(truth, truth.then_some("S1")), t(2.1));
            assert_eq!(sat.state().session_active, truth, "cached={cached} truth={truth}");
            if truth {
                assert_eq!(sat.state().session_id.as_deref(), Some("S1"));
            }
        }
    }

    #[test]
    fn test_flapping_link_requests_state_on_every_regain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        let mut requests = 0;
        for (i, reachable) in [true, true, false, true, false, false, true].into_iter().enumerate() {
            sat.on_reachability_changed(reachable, t(i as f64));
            requests += sat
                .take_commands()
                .iter()
                .filter(|c| **c == Command::RequestState)
                .count();
        }
        assert_eq!(requests, 3);
    }

    #[test]
    fn test_reply_with_new_session_id_restarts_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_session_started("S1", t(0.0));
        sat.on_state_reply(reply(true, Some("S2")), t(5.0));
        assert!(sat.state().session_active);
        assert_eq!(sat.state().session_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_watchdog_timeout_stops_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.1));
        for hb in [2.0, 4.0, 6.0] {
            sat.on_heartbeat(t(hb));
        }
        assert!(sat.toggle_recording(t(6.2)));
        sat.take_commands();

        sat.on_watchdog_tick(t(6.5));
        assert!(sat.state().session_active);

        sat.on_watchdog_tick(t(9.1));
        assert!(!sat.state().session_active);
        assert!(!sat.is_recording());
        assert_eq!(
            sat.notice(),
            Some(&Notice::ConnectionLost {
                reason: LossReason::HeartbeatTimeout
            })
        );

        let commands = sat.take_commands();
        assert!(commands.contains(&Command::StopWatchdog));
        let flushed = submissions(&commands);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].meta.recording_end, t(9.1));
    }

    #[test]
    fn test_heartbeat_never_resurrects_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_session_started("S1", t(0.0));
        sat.on_watchdog_tick(t(4.0));
        assert!(!sat.state().session_active);

        sat.on_heartbeat(t(5.0));
        sat.on_watchdog_tick(t(6.0));
        assert!(!sat.state().session_active);
        assert!(!sat.toggle_recording(t(6.5)));
    }

    #[test]
    fn test_disconnect_stops_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.0));
        sat.on_heartbeat(t(1.0));

        sat.on_reachability_changed(false, t(1.2));
        assert!(!sat.state().session_active);
        assert_eq!(
            sat.notice(),
            Some(&Notice::ConnectionLost {
                reason: LossReason::Disconnected
            })
        );
    }

    #[test]
    fn test_disconnect_holds_flushed_clip_for_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = Satellite::new(
            FakeDevice::new(tmp.path()),
            TransferQueue::new(tmp.path(), "watch", 4),
            Watchdog::default(),
        );
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.0));
        assert!(sat.toggle_recording(t(1.0)));
        sat.take_commands();

        sat.on_reachability_changed(false, t(2.0));
        assert!(!sat.is_recording());
        assert!(submissions(&sat.take_commands()).is_empty());
        assert_eq!(sat.transfers().held_len(), 1);
        assert_eq!(sat.transfers().outstanding_len(), 0);

        // Regaining the link sends it.
        sat.on_reachability_changed(true, t(3.0));
        let sent = submissions(&sat.take_commands());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].meta.recording_end, t(2.0));
    }

    #[test]
    fn test_disconnect_without_retry_drops_flushed_clip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.0));
        assert!(sat.toggle_recording(t(1.0)));
        sat.take_commands();

        sat.on_reachability_changed(false, t(2.0));
        assert!(submissions(&sat.take_commands()).is_empty());
        assert_eq!(sat.transfers().outstanding_len(), 0);
        assert_eq!(sat.transfers().held_len(), 0);
        // The loss outranks the dropped clip.
        assert_eq!(
            sat.notice(),
            Some(&Notice::ConnectionLost {
                reason: LossReason::Disconnected
            })
        );
    }

    #[test]
    fn test_connection_lost_notice_survives_reconciliation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.0));
        sat.on_reachability_changed(false, t(1.0));
        sat.on_reachability_changed(true, t(2.0));
        sat.on_state_reply(reply(true, Some("S1")), t(2.1));

        assert!(sat.state().session_active);
        assert_eq!(
            sat.notice(),
            Some(&Notice::ConnectionLost {
                reason: LossReason::Disconnected
            })
        );
        sat.dismiss_notice();
        assert!(sat.notice().is_none());
    }

    #[test]
    fn test_stop_when_idle_enqueues_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sat = satellite(tmp.path());
        sat.on_session_ended(t(1.0));
        assert!(sat.take_commands().is_empty());
        assert_eq!(sat.transfers().outstanding_len(), 0);
    }

    #[test]
    fn test_clip_delivery_cleans_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let mut sat = satellite(&scratch);
        sat.on_reachability_changed(true, t(0.0));
        sat.on_session_started("S1", t(0.0));

        assert!(sat.toggle_recording(t(10.0)));
        assert!(!sat.toggle_recording(t(25.0)));
        let sent = submissions(&sat.take_commands());
        assert_eq!(sent.len(), 1);
        let ticket = &sent[0];
        assert_eq!(ticket.meta.recording_start, t(10.0));
        assert_eq!(ticket.meta.recording_end, t(25.0));
        assert!(ticket.clip.local_file.exists());

        sat.on_transfer_completed(&TransferReceipt {
            clip_id: ticket.meta.clip_id.clone(),
            artifact_id: "S1/c1".into(),
            duplicate: false,
        });
        assert!(!ticket.clip.local_file.exists());
        assert_eq!(sat.transfers().purge_count(), 1);
    }

    #[test]
    fn test_capture_failure_raises_notice() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new(tmp.path());
        device.fail_start = true;
        let mut sat = Satellite::new(
            device,
            TransferQueue::new(tmp.path(), "watch", 0),
            Watchdog::default(),
        );
        sat.on_session_started("S1", t(0.0));

        assert!(!sat.toggle_recording(t(1.0)));
        assert!(matches!(
            sat.notice(),
            Some(Notice::CaptureUnavailable { .. })
        ));
        assert!(sat.state().session_active);
    }
}

//! Capture state machine: `Idle → Recording → Idle`.
//!
//! A single hardware button drives [`CaptureMachine::toggle`].  Stopping
//! hands the finished clip to a [`ClipSink`] before the recorder forgets
//! it, so no artifact is ever orphaned between the two.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use touchline_common::protocol::ClipId;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot finalize clip: {0}")]
    Finalize(String),
}

/// An open recording on the capture device.
#[derive(Debug)]
pub struct ClipHandle {
    pub clip_id: ClipId,
    pub path: PathBuf,
}

/// Boundary to the audio hardware.
pub trait CaptureDevice: Send {
    fn start_capture(&mut self, clip_id: &str) -> Result<ClipHandle, CaptureError>;
    /// Close the sink and return the finished file.
    fn stop_capture(&mut self, handle: ClipHandle) -> Result<PathBuf, CaptureError>;
}

/// A finished capture awaiting transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureClip {
    pub clip_id: ClipId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub local_file: PathBuf,
}

/// Receives clips the moment they are stopped.
pub trait ClipSink {
    fn accept(&mut self, clip: CaptureClip);
}

impl ClipSink for Vec<CaptureClip> {
    fn accept(&mut self, clip: CaptureClip) {
        self.push(clip);
    }
}

#[derive(Debug)]
struct ActiveCapture {
    handle: ClipHandle,
    started_at: DateTime<Utc>,
}

pub struct CaptureMachine<D> {
    device: D,
    active: Option<ActiveCapture>,
    sequence: u64,
}

impl<D: CaptureDevice> CaptureMachine<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            active: None,
            sequence: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open a new clip.  Returns `Ok(false)` when already recording.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<bool, CaptureError> {
        if let Some(active) = &self.active {
            warn!("Capture already running ({}); start ignored", active.handle.clip_id);
            return Ok(false);
        }

        self.sequence += 1;
        let clip_id = format!("clip-{}-{:04}", now.format("%Y%m%dT%H%M%S"), self.sequence);
        let handle = self.device.start_capture(&clip_id)?;
        info!("Capture started: {clip_id} → {}", handle.path.display());

        self.active = Some(ActiveCapture {
            handle,
            started_at: now,
        });
        Ok(true)
    }

    /// Close the current clip and hand it to `sink`.  Returns `Ok(false)`
    /// when idle; no clip is produced in that case.
    pub fn stop(
        &mut self,
        now: DateTime<Utc>,
        sink: &mut impl ClipSink,
    ) -> Result<bool, CaptureError> {
        let Some(active) = self.active.take() else {
            warn!("No capture running; stop ignored");
            return Ok(false);
        };

        let clip_id = active.handle.clip_id.clone();
        let local_file = self.device.stop_capture(active.handle)?;
        let clip = CaptureClip {
            clip_id,
            started_at: active.started_at,
            ended_at: now.max(active.started_at),
            local_file,
        };
        info!(
            "Capture stopped: {} ({:.1}s)",
            clip.clip_id,
            (clip.ended_at - clip.started_at).num_milliseconds() as f64 / 1000.0
        );
        sink.accept(clip);
        Ok(true)
    }

    /// Start when idle, stop when recording.
    pub fn toggle(
        &mut self,
        now: DateTime<Utc>,
        sink: &mut impl ClipSink,
    ) -> Result<(), CaptureError> {
        if self.is_recording() {
            self.stop(now, sink).map(|_| ())
        } else {
            self.start(now).map(|_| ())
        }
    }

    /// Derived duration for the display; `None` when idle.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.active
            .as_ref()
            .map(|a| (now - a.started_at).to_std().unwrap_or_default())
    }
}

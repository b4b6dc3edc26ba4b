//! Capture devices behind [`CaptureDevice`].
//!
//! `arecord` is spawned once per clip and writes straight into the scratch
//! directory.  The silent device stands in on hosts without a microphone.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use touchline_common::config::{CaptureDeviceKind, Config};

use crate::recorder::{CaptureDevice, CaptureError, ClipHandle};

const SAMPLE_RATE: u32 = 48_000;
/// Upper bound on a silent clip, to keep a forgotten toggle from filling
/// the disk.
const SILENT_MAX_SECS: f64 = 600.0;

/// Build the device named in the config.
pub fn from_config(config: &Config) -> Box<dyn CaptureDevice> {
    match config.capture_device {
        CaptureDeviceKind::Arecord => Box::new(ArecordDevice::new(
            &config.scratch_dir,
            config.channels,
            config.rec_card.clone(),
        )),
        CaptureDeviceKind::Silent => Box::new(SilentDevice::new(&config.scratch_dir)),
    }
}

impl CaptureDevice for Box<dyn CaptureDevice> {
    fn start_capture(&mut self, clip_id: &str) -> Result<ClipHandle, CaptureError> {
        (**self).start_capture(clip_id)
    }

    fn stop_capture(&mut self, handle: ClipHandle) -> Result<PathBuf, CaptureError> {
        (**self).stop_capture(handle)
    }
}

// ── arecord ──────────────────────────────────────────────────────────────

pub struct ArecordDevice {
    scratch_dir: PathBuf,
    channels: u16,
    rec_card: Option<String>,
    child: Option<Child>,
}

impl ArecordDevice {
    pub fn new(scratch_dir: &Path, channels: u16, rec_card: Option<String>) -> Self {
        Self {
            scratch_dir: scratch_dir.to_path_buf(),
            channels,
            rec_card,
            child: None,
        }
    }
}

impl CaptureDevice for ArecordDevice {
    fn start_capture(&mut self, clip_id: &str) -> Result<ClipHandle, CaptureError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let path = self.scratch_dir.join(format!("{clip_id}.wav"));

        let mut cmd = Command::new("arecord");
        cmd.args([
            "-q",
            "-f",
            "S16_LE",
            &format!("-c{}", self.channels),
            &format!("-r{SAMPLE_RATE}"),
            "-t",
            "wav",
        ]);
        if let Some(card) = &self.rec_card {
            cmd.args(["-D", card]);
        }
        cmd.arg(&path);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::Unavailable(format!("cannot spawn arecord: {e}")))?;

        // Drain stderr so ALSA errors reach the log and the pipe never fills.
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("arecord-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[arecord] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("arecord stderr stream ended");
                })
                .ok();
        }

        if let Ok(Some(status)) = child.try_wait() {
            return Err(CaptureError::Unavailable(format!(
                "arecord exited immediately with {status} (check REC_CARD)"
            )));
        }

        info!(
            "arecord started (pid={}, channels={}, card={:?})",
            child.id(),
            self.channels,
            self.rec_card
        );
        self.child = Some(child);
        Ok(ClipHandle {
            clip_id: clip_id.to_string(),
            path,
        })
    }

    fn stop_capture(&mut self, handle: ClipHandle) -> Result<PathBuf, CaptureError> {
        let Some(mut child) = self.child.take() else {
            return Err(CaptureError::Finalize(format!(
                "no arecord process for {}",
                handle.clip_id
            )));
        };
        // arecord writes its WAV header up front, so a killed process still
        // leaves a readable file.
        let _ = child.kill();
        let status = child.wait()?;
        debug!("arecord for {} exited with {status}", handle.clip_id);

        if !handle.path.exists() {
            return Err(CaptureError::Finalize(format!(
                "arecord produced no file at {}",
                handle.path.display()
            )));
        }
        Ok(handle.path)
    }
}

impl Drop for ArecordDevice {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
        }
    }
}

// ── silent ───────────────────────────────────────────────────────────────

/// Writes a mono 16-bit WAV of silence as long as the capture lasted.
pub struct SilentDevice {
    scratch_dir: PathBuf,
    started: Option<Instant>,
}

impl SilentDevice {
    pub fn new(scratch_dir: &Path) -> Self {
        Self {
            scratch_dir: scratch_dir.to_path_buf(),
            started: None,
        }
    }
}

impl CaptureDevice for SilentDevice {
    fn start_capture(&mut self, clip_id: &str) -> Result<ClipHandle, CaptureError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        self.started = Some(Instant::now());
        Ok(ClipHandle {
            clip_id: clip_id.to_string(),
            path: self.scratch_dir.join(format!("{clip_id}.wav")),
        })
    }

    fn stop_capture(&mut self, handle: ClipHandle) -> Result<PathBuf, CaptureError> {
        let secs = self
            .started
            .take()
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
            .min(SILENT_MAX_SECS);
        write_silence(&handle.path, secs)?;
        Ok(handle.path)
    }
}

fn write_silence(path: &Path, secs: f64) -> Result<(), CaptureError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let finalize = |e: hound::Error| CaptureError::Finalize(e.to_string());
    let mut writer = hound::WavWriter::create(path, spec).map_err(finalize)?;
    let samples = (secs * SAMPLE_RATE as f64) as usize;
    for _ in 0..samples {
        writer.write_sample(0i16).map_err(finalize)?;
    }
    writer.finalize().map_err(finalize)
}

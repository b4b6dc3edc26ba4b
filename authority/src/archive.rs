//! Durable record of ingested clips.
//!
//! [`ArchiveStore`] moves each uploaded WAV into `ARCHIVE_DIR/<session>/`
//! and appends one JSON line per clip to that directory's `index.jsonl`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub type ArtifactId = String;

pub const INDEX_FILE: &str = "index.jsonl";

/// Everything the store needs to file one clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub session_id: String,
    pub team_id: String,
    pub clip_id: String,
    pub recording_start: DateTime<Utc>,
    pub recording_end: DateTime<Utc>,
    /// Seconds from the session start, on the authority's clock.  The two
    /// devices are not synchronised, so these may be slightly off or even
    /// negative.
    pub offset_start_secs: f64,
    pub offset_end_secs: f64,
    pub auxiliary_label: String,
    /// Uploaded file, absent when the transport carried metadata only.
    #[serde(skip)]
    pub file: Option<PathBuf>,
}

/// One line of `index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub artifact_id: ArtifactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_file: Option<PathBuf>,
    #[serde(flatten)]
    pub record: IngestRecord,
}

/// The persistence boundary.
pub trait ClipStore: Send {
    fn ingest_clip(&mut self, record: &IngestRecord) -> Result<ArtifactId>;
}

pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Session ids come from the coach's UI; keep them inside the archive.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        if safe.is_empty() || safe.starts_with('.') {
            self.root.join(format!("_{safe}"))
        } else {
            self.root.join(safe)
        }
    }
}

impl ClipStore for ArchiveStore {
    fn ingest_clip(&mut self, record: &IngestRecord) -> Result<ArtifactId> {
        let dir = self.session_dir(&record.session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let archived_file = match &record.file {
            Some(src) => {
                let dest = dir.join(format!("{}.wav", record.clip_id));
                move_file(src, &dest)?;
                debug!("Archived {} → {}", src.display(), dest.display());
                Some(dest)
            }
            None => None,
        };

        let entry = IndexEntry {
            artifact_id: format!("{}/{}", record.session_id, record.clip_id),
            archived_file,
            record: record.clone(),
        };
        let index = dir.join(INDEX_FILE);
        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .with_context(|| format!("Cannot open {}", index.display()))?;
        writeln!(out, "{}", serde_json::to_string(&entry)?)
            .with_context(|| format!("Cannot append to {}", index.display()))?;

        info!(
            "Ingested {} ({:.1}s – {:.1}s into {})",
            entry.artifact_id, record.offset_start_secs, record.offset_end_secs, record.session_id
        );
        Ok(entry.artifact_id)
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)
        .with_context(|| format!("Cannot copy {} to {}", src.display(), dest.display()))?;
    std::fs::remove_file(src).with_context(|| format!("Cannot remove {}", src.display()))?;
    Ok(())
}

/// Read a session's index back.
pub fn read_index(session_dir: &Path) -> Result<Vec<IndexEntry>> {
    let index = session_dir.join(INDEX_FILE);
    let text = match std::fs::read_to_string(&index) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Cannot read {}", index.display())),
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Malformed index line"))
        .collect()
}

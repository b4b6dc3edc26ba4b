//! Transfer queue and two-tier cleanup of the scratch directory.
//!
//! Every stopped clip becomes a [`TransferTicket`].  While the link is
//! reachable the ticket is submitted at once; otherwise it is dropped, or
//! held in a small bounded retry buffer when one is configured.  Each
//! confirmed delivery deletes exactly that clip's file, and the whole
//! scratch directory is purged only once nothing is left in flight.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use touchline_common::protocol::{ClipId, ClipTicket};

use crate::recorder::{CaptureClip, ClipSink};

/// A clip plus the metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTicket {
    pub clip: CaptureClip,
    pub meta: ClipTicket,
}

impl TransferTicket {
    pub fn new(clip: CaptureClip, auxiliary_label: &str) -> Self {
        let meta = ClipTicket {
            clip_id: clip.clip_id.clone(),
            recording_start: clip.started_at,
            recording_end: clip.ended_at,
            auxiliary_label: auxiliary_label.to_string(),
        };
        Self { clip, meta }
    }

    pub fn clip_id(&self) -> &str {
        &self.clip.clip_id
    }
}

/// What happened to a ticket at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Submitted,
    /// Unreachable; parked in the retry buffer.
    Held,
    /// Unreachable and nowhere to park it.
    Dropped,
}

pub struct TransferQueue {
    scratch_dir: PathBuf,
    auxiliary_label: String,
    reachable: bool,
    /// Submitted and not yet acknowledged.
    outstanding: HashMap<ClipId, PathBuf>,
    /// Submitted since the owner last drained them.
    submissions: Vec<TransferTicket>,
    retry: VecDeque<TransferTicket>,
    retry_capacity: usize,
    dropped: Vec<ClipId>,
    purges: u64,
}

impl TransferQueue {
    pub fn new(scratch_dir: impl Into<PathBuf>, auxiliary_label: &str, retry_capacity: usize) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            auxiliary_label: auxiliary_label.to_string(),
            reachable: false,
            outstanding: HashMap::new(),
            submissions: Vec::new(),
            retry: VecDeque::new(),
            retry_capacity,
            dropped: Vec::new(),
            purges: 0,
        }
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn held_len(&self) -> usize {
        self.retry.len()
    }

    /// How many times the scratch directory has been purged.
    pub fn purge_count(&self) -> u64 {
        self.purges
    }

    pub fn enqueue(&mut self, ticket: TransferTicket) -> Enqueued {
        if self.reachable {
            self.submit(ticket);
            return Enqueued::Submitted;
        }

        if self.retry_capacity == 0 {
            warn!("Link unreachable; dropping transfer of {}", ticket.clip_id());
            self.dropped.push(ticket.clip.clip_id);
            return Enqueued::Dropped;
        }

        if self.retry.len() >= self.retry_capacity {
            if let Some(evicted) = self.retry.pop_front() {
                warn!("Retry buffer full; dropping oldest held clip {}", evicted.clip_id());
                self.dropped.push(evicted.clip.clip_id);
            }
        }
        info!("Link unreachable; holding {} for retry", ticket.clip_id());
        self.retry.push_back(ticket);
        Enqueued::Held
    }

    /// Mirror the link's reachability.  Regaining it resubmits held tickets.
    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if reachable && !self.retry.is_empty() {
            info!("Resubmitting {} held transfer(s)", self.retry.len());
            while let Some(ticket) = self.retry.pop_front() {
                self.submit(ticket);
            }
        }
    }

    /// Drain tickets that need to go out on the transport.
    pub fn take_submissions(&mut self) -> Vec<TransferTicket> {
        std::mem::take(&mut self.submissions)
    }

    /// Drain ids of clips given up on since the last call.
    pub fn take_dropped(&mut self) -> Vec<ClipId> {
        std::mem::take(&mut self.dropped)
    }

    /// The transport confirmed delivery: delete that one file.
    pub fn complete(&mut self, clip_id: &str) -> Result<bool> {
        let Some(path) = self.outstanding.remove(clip_id) else {
            debug!("Completion for unknown clip {clip_id}; ignoring");
            return Ok(false);
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Deleted delivered clip {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot delete {}", path.display()));
            }
        }
        info!("Transfer of {clip_id} complete ({} outstanding)", self.outstanding.len());
        Ok(true)
    }

    /// The send failed after submission.  The file stays in scratch until
    /// the next purge; nothing retries it.
    pub fn fail(&mut self, clip_id: &str, reason: &str) {
        if self.outstanding.remove(clip_id).is_some() {
            warn!("Transfer of {clip_id} failed: {reason}");
            self.dropped.push(clip_id.to_string());
        }
    }

    /// Purge the scratch directory iff nothing is in flight, nothing is held
    /// for retry and no capture is writing into it.  Returns whether a
    /// purge happened.
    pub fn cleanup_if_safe(&mut self, capture_active: bool) -> Result<bool> {
        if !self.outstanding.is_empty() || !self.retry.is_empty() || capture_active {
            return Ok(false);
        }
        if !self.scratch_dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&self.scratch_dir)
            .with_context(|| format!("Cannot purge {}", self.scratch_dir.display()))?;
        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("Cannot recreate {}", self.scratch_dir.display()))?;
        self.purges += 1;
        info!("Scratch directory purged ({})", self.scratch_dir.display());
        Ok(true)
    }

    fn submit(&mut self, ticket: TransferTicket) {
        debug!("Submitting transfer of {}", ticket.clip_id());
        self.outstanding
            .insert(ticket.clip.clip_id.clone(), ticket.clip.local_file.clone());
        self.submissions.push(ticket);
    }
}

impl ClipSink for TransferQueue {
    fn accept(&mut self, clip: CaptureClip) {
        let ticket = TransferTicket::new(clip, &self.auxiliary_label);
        self.enqueue(ticket);
    }
}

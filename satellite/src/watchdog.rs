//! Liveness watchdog fed by the authority's heartbeats.
//!
//! Heartbeats carry no state: they only move `last_heartbeat_at`.  Arming
//! and disarming follow the session, so a heartbeat arriving while no
//! session is active never brings recording back.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not monitoring; nothing to check.
    Disarmed,
    Alive,
    Expired { silent_for: Duration },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    armed: bool,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: false,
            last_heartbeat_at: None,
        }
    }

    /// Arm the watchdog.  `now` becomes the baseline so a stale heartbeat
    /// from a previous session cannot expire the new one immediately.
    pub fn start_monitoring(&mut self, now: DateTime<Utc>) {
        self.armed = true;
        self.last_heartbeat_at = Some(now);
    }

    pub fn stop_monitoring(&mut self) {
        self.armed = false;
    }

    pub fn is_monitoring(&self) -> bool {
        self.armed
    }

    pub fn on_heartbeat_received(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(now);
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at
    }

    /// Expired only when strictly more than `timeout` has passed.
    pub fn check(&self, now: DateTime<Utc>) -> Verdict {
        if !self.armed {
            return Verdict::Disarmed;
        }
        let Some(last) = self.last_heartbeat_at else {
            return Verdict::Alive;
        };
        let silent_for = (now - last).to_std().unwrap_or_default();
        if silent_for > self.timeout {
            Verdict::Expired { silent_for }
        } else {
            Verdict::Alive
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

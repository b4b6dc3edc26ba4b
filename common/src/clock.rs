//! Wall-clock sources for event timestamps.
//!
//! Each device stamps events with its own clock; nothing here attempts to
//! synchronise the two sides.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall clock anchored once and then advanced by tokio's monotonic
/// clock.  Under a paused test runtime it moves with `tokio::time::advance`,
/// which keeps timestamps consistent with the timers that produced them.
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    anchor: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl VirtualClock {
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_default();
        self.anchor + elapsed
    }
}

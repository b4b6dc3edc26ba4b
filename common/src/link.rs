//! Link activation and reachability tracking, shared by both sides.
//!
//! A link moves `Inactive → Activating → Active`.  Senders wait on the
//! [`ActivationGate`] instead of failing while activation is pending, and a
//! probe loop flips the gate between `Activating` and `Active` as the peer
//! comes and goes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Inactive,
    Activating,
    Active,
}

/// Failures of a single send over the link.  None of these are fatal; the
/// caller logs and moves on.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link did not become active within {0:?}")]
    ActivationTimeout(Duration),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("cannot read payload: {0}")]
    Payload(String),
    #[error("link closed")]
    Closed,
}

/// Shared view of one side's link phase.
#[derive(Debug, Clone)]
pub struct ActivationGate {
    phase: Arc<watch::Sender<LinkPhase>>,
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LinkPhase::Inactive);
        Self { phase: Arc::new(tx) }
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == LinkPhase::Active
    }

    /// `Inactive → Activating`.  No effect in any other phase.
    pub fn activate(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == LinkPhase::Inactive {
                *phase = LinkPhase::Activating;
                true
            } else {
                false
            }
        });
    }

    /// Back to `Inactive`; pending waiters keep waiting for a new activation.
    pub fn deactivate(&self) {
        self.phase.send_replace(LinkPhase::Inactive);
    }

    /// Record a probe result.  Returns `Some(reachable)` when reachability
    /// actually changed; probes on an inactive link are ignored.
    pub fn mark_reachable(&self, reachable: bool) -> Option<bool> {
        let mut transition = None;
        self.phase.send_if_modified(|phase| {
            let next = match (*phase, reachable) {
                (LinkPhase::Activating, true) => LinkPhase::Active,
                (LinkPhase::Active, false) => LinkPhase::Activating,
                _ => return false,
            };
            *phase = next;
            transition = Some(reachable);
            true
        });
        transition
    }

    /// Wait until the link is `Active`, for at most `timeout`.
    pub async fn wait_active(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut rx = self.phase.subscribe();
        let result =
            match tokio::time::timeout(timeout, rx.wait_for(|p| *p == LinkPhase::Active)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(LinkError::Closed),
                Err(_) => Err(LinkError::ActivationTimeout(timeout)),
            };
        result
    }
}

/// Probe the peer every `interval` until `cancel` fires, feeding results
/// into `gate`.  `on_change` runs on every reachability transition.
pub fn spawn_probe_loop<P, Fut, C>(
    gate: ActivationGate,
    interval: Duration,
    cancel: CancellationToken,
    probe: P,
    on_change: C,
) -> JoinHandle<()>
where
    P: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    C: Fn(bool) + Send + 'static,
{
    gate.activate();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = probe().await;
            if let Err(e) = &result {
                debug!("Probe failed: {e}");
            }
            if let Some(reachable) = gate.mark_reachable(result.is_ok()) {
                info!("Peer {}", if reachable { "reachable" } else { "unreachable" });
                on_change(reachable);
            }
        }
        gate.deactivate();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_probes_ignored_until_activated() {
        let gate = ActivationGate::new();
        assert_eq!(gate.mark_reachable(true), None);
        assert_eq!(gate.phase(), LinkPhase::Inactive);

        gate.activate();
        assert_eq!(gate.phase(), LinkPhase::Activating);
        assert_eq!(gate.mark_reachable(true), Some(true));
        assert_eq!(gate.mark_reachable(true), None);
        assert_eq!(gate.mark_reachable(false), Some(false));
        assert_eq!(gate.phase(), LinkPhase::Activating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_behind_activation() {
        let gate = ActivationGate::new();
        gate.activate();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_active(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        gate.mark_reachable(true);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_timeout() {
        let gate = ActivationGate::new();
        let err = gate.wait_active(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, LinkError::ActivationTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_reports_transitions() {
        let gate = ActivationGate::new();
        let up = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let handle = {
            let up = up.clone();
            let seen = seen.clone();
            spawn_probe_loop(
                gate.clone(),
                Duration::from_secs(1),
                cancel.clone(),
                move || {
                    let up = up.load(Ordering::SeqCst);
                    async move {
                        if up {
                            Ok(())
                        } else {
                            Err(LinkError::Unreachable("down".into()))
                        }
                    }
                },
                move |reachable| seen.lock().unwrap().push(reachable),
            )
        };

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, false, true]);
        assert_eq!(gate.phase(), LinkPhase::Inactive);
    }
}

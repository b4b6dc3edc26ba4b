//! Single-writer actor around [`Satellite`].
//!
//! One task owns the state.  Authority pushes, the wearer's button, the
//! watchdog timer, reachability probes and transfer completions all arrive
//! as [`Event`]s on one queue; link sends run in spawned tasks and post
//! their outcome back onto the same queue.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use touchline_common::clock::Clock;
use touchline_common::config::Config;
use touchline_common::link::{spawn_probe_loop, ActivationGate, LinkError};
use touchline_common::protocol::{ClipId, StateReply, TransferReceipt};

use crate::recorder::CaptureDevice;
use crate::satellite::{Command, Satellite};
use crate::state::StatusSnapshot;
use crate::transport::AuthorityTransport;

#[derive(Debug)]
pub enum Event {
    Heartbeat,
    SessionStarted(String),
    SessionEnded,
    Toggle { reply: oneshot::Sender<bool> },
    DismissNotice,
    WatchdogTick,
    Reachability(bool),
    StateReply(StateReply),
    TransferCompleted(TransferReceipt),
    TransferFailed { clip_id: ClipId, reason: String },
}

/// Cloneable entry point for the server and the link inboxes.
#[derive(Clone)]
pub struct SatelliteHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SatelliteHandle {
    /// A handle whose events land in the returned receiver instead of a
    /// running actor.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, event: Event) -> Result<(), LinkError> {
        self.tx.send(event).map_err(|_| LinkError::Closed)
    }

    /// Press the button; resolves to whether a capture is now running.
    pub async fn toggle(&self) -> Result<bool, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Toggle { reply })?;
        rx.await.map_err(|_| LinkError::Closed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub watchdog_tick: Duration,
    pub duration_poll: Duration,
    pub probe_interval: Duration,
    pub activation_timeout: Duration,
}

impl From<&Config> for Timings {
    fn from(config: &Config) -> Self {
        Self {
            watchdog_tick: config.watchdog_tick,
            duration_poll: config.duration_poll,
            probe_interval: config.probe_interval,
            activation_timeout: config.activation_timeout,
        }
    }
}

pub struct SatelliteRuntime<D, T, C> {
    actor: Actor<D, T, C>,
    events: mpsc::UnboundedReceiver<Event>,
}

struct Actor<D, T, C> {
    core: Satellite<D>,
    transport: T,
    clock: C,
    gate: ActivationGate,
    timings: Timings,
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Sender<StatusSnapshot>,
    watchdog_timer: Option<CancellationToken>,
}

impl<D, T, C> SatelliteRuntime<D, T, C>
where
    D: CaptureDevice + 'static,
    T: AuthorityTransport,
    C: Clock,
{
    pub fn new(core: Satellite<D>, transport: T, clock: C, timings: Timings) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(StatusSnapshot::default());
        Self {
            actor: Actor {
                core,
                transport,
                clock,
                gate: ActivationGate::new(),
                timings,
                tx,
                status,
                watchdog_timer: None,
            },
            events,
        }
    }

    pub fn handle(&self) -> SatelliteHandle {
        SatelliteHandle {
            tx: self.actor.tx.clone(),
        }
    }

    /// Latest snapshot, refreshed every `duration_poll` and after each event.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.actor.status.subscribe()
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            mut actor,
            mut events,
        } = self;

        let probe = {
            let transport = actor.transport.clone();
            let tx = actor.tx.clone();
            spawn_probe_loop(
                actor.gate.clone(),
                actor.timings.probe_interval,
                cancel.child_token(),
                move || {
                    let transport = transport.clone();
                    async move { transport.probe().await }
                },
                move |reachable| {
                    let _ = tx.send(Event::Reachability(reachable));
                },
            )
        };

        actor.core.launch();
        actor.execute();
        actor.publish();

        let mut poll = tokio::time::interval(actor.timings.duration_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Satellite runtime started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => {
                    actor.handle(event);
                    actor.execute();
                    actor.publish();
                }
                _ = poll.tick() => actor.publish(),
            }
        }

        actor.cancel_watchdog_timer();
        let _ = probe.await;
        info!("Satellite runtime stopped");
    }
}

impl<D, T, C> Actor<D, T, C>
where
    D: CaptureDevice,
    T: AuthorityTransport,
    C: Clock,
{
    fn handle(&mut self, event: Event) {
        let now = self.clock.now();
        debug!("Event: {event:?}");
        match event {
            Event::Heartbeat => self.core.on_heartbeat(now),
            Event::SessionStarted(id) => self.core.on_session_started(&id, now),
            Event::SessionEnded => self.core.on_session_ended(now),
            Event::Toggle { reply } => {
                let recording = self.core.toggle_recording(now);
                let _ = reply.send(recording);
            }
            Event::DismissNotice => self.core.dismiss_notice(),
            Event::WatchdogTick => self.core.on_watchdog_tick(now),
            Event::Reachability(reachable) => self.core.on_reachability_changed(reachable, now),
            Event::StateReply(reply) => self.core.on_state_reply(reply, now),
            Event::TransferCompleted(receipt) => self.core.on_transfer_completed(&receipt),
            Event::TransferFailed { clip_id, reason } => {
                self.core.on_transfer_failed(&clip_id, &reason)
            }
        }
    }

    fn execute(&mut self) {
        for command in self.core.take_commands() {
            match command {
                Command::RequestState => self.spawn_state_request(),
                Command::Submit(ticket) => {
                    let transport = self.transport.clone();
                    let gate = self.gate.clone();
                    let tx = self.tx.clone();
                    let wait = self.timings.activation_timeout;
                    tokio::spawn(async move {
                        let clip_id = ticket.clip.clip_id.clone();
                        let result = match gate.wait_active(wait).await {
                            Ok(()) => transport.submit_clip(&ticket).await,
                            Err(e) => Err(e),
                        };
                        let event = match result {
                            Ok(receipt) => Event::TransferCompleted(receipt),
                            Err(e) => Event::TransferFailed {
                                clip_id,
                                reason: e.to_string(),
                            },
                        };
                        let _ = tx.send(event);
                    });
                }
                Command::StartWatchdog => self.start_watchdog_timer(),
                Command::StopWatchdog => self.cancel_watchdog_timer(),
            }
        }
    }

    fn spawn_state_request(&self) {
        let transport = self.transport.clone();
        let gate = self.gate.clone();
        let tx = self.tx.clone();
        let wait = self.timings.activation_timeout;
        tokio::spawn(async move {
            if let Err(e) = gate.wait_active(wait).await {
                warn!("State request not sent: {e}");
                return;
            }
            match transport.request_state().await {
                Ok(reply) => {
                    let _ = tx.send(Event::StateReply(reply));
                }
                Err(e) => warn!("State request failed: {e}"),
            }
        });
    }

    fn start_watchdog_timer(&mut self) {
        self.cancel_watchdog_timer();
        let token = CancellationToken::new();
        let period = self.timings.watchdog_tick;
        let tx = self.tx.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(Event::WatchdogTick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.watchdog_timer = Some(token);
    }

    fn cancel_watchdog_timer(&mut self) {
        if let Some(token) = self.watchdog_timer.take() {
            token.cancel();
        }
    }

    fn publish(&self) {
        let mut snapshot = self.core.status(self.clock.now());
        snapshot.link = self.gate.phase();
        self.status.send_replace(snapshot);
    }
}

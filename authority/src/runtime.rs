//! Single-writer actor around the [`Orchestrator`].
//!
//! HTTP handlers and the in-memory inbox talk to it through an
//! [`AuthorityHandle`].  Heartbeats run on their own cancellable task;
//! session notifications go through one ordered notifier task that waits
//! on the activation gate.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use touchline_common::clock::Clock;
use touchline_common::config::Config;
use touchline_common::link::{spawn_probe_loop, ActivationGate, LinkPhase};
use touchline_common::protocol::{ClipTicket, StateReply, TransferReceipt};

use crate::archive::ClipStore;
use crate::orchestrator::{Command, Orchestrator};
use crate::session::{SessionContext, SessionError, StartSessionRequest};
use crate::transport::SatelliteTransport;

/// What `GET /api/session` reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: Option<SessionContext>,
    pub satellite_reachable: bool,
    pub link: LinkPhase,
    pub ingested_clips: usize,
}

#[derive(Debug)]
pub enum Request {
    StartSession {
        request: StartSessionRequest,
        reply: oneshot::Sender<Result<SessionContext, SessionError>>,
    },
    StopSession {
        reply: oneshot::Sender<Option<SessionContext>>,
    },
    State {
        reply: oneshot::Sender<StateReply>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Ingest {
        ticket: ClipTicket,
        file: Option<PathBuf>,
        reply: oneshot::Sender<Result<TransferReceipt, SessionError>>,
    },
    Reachability(bool),
}

#[derive(Debug)]
enum Notification {
    Started(String),
    Ended,
}

#[derive(Clone)]
pub struct AuthorityHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl AuthorityHandle {
    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<SessionContext, SessionError> {
        self.call(|reply| Request::StartSession { request, reply })
            .await?
    }

    pub async fn stop_session(&self) -> Result<Option<SessionContext>, SessionError> {
        self.call(|reply| Request::StopSession { reply }).await
    }

    pub async fn state(&self) -> Result<StateReply, SessionError> {
        self.call(|reply| Request::State { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.call(|reply| Request::Status { reply }).await
    }

    pub async fn ingest(
        &self,
        ticket: ClipTicket,
        file: Option<PathBuf>,
    ) -> Result<TransferReceipt, SessionError> {
        self.call(|reply| Request::Ingest { ticket, file, reply })
            .await?
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub heartbeat_interval: Duration,
    pub probe_interval: Duration,
    pub activation_timeout: Duration,
}

impl From<&Config> for Timings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            probe_interval: config.probe_interval,
            activation_timeout: config.activation_timeout,
        }
    }
}

pub struct AuthorityRuntime<S, T, C> {
    actor: Actor<S, T, C>,
    requests: mpsc::UnboundedReceiver<Request>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

struct Actor<S, T, C> {
    orchestrator: Orchestrator<S>,
    transport: T,
    clock: C,
    gate: ActivationGate,
    timings: Timings,
    tx: mpsc::UnboundedSender<Request>,
    notifier: mpsc::UnboundedSender<Notification>,
    heartbeat: Option<CancellationToken>,
    satellite_reachable: bool,
}

impl<S, T, C> AuthorityRuntime<S, T, C>
where
    S: ClipStore + 'static,
    T: SatelliteTransport,
    C: Clock,
{
    pub fn new(orchestrator: Orchestrator<S>, transport: T, clock: C, timings: Timings) -> Self {
        let (tx, requests) = mpsc::unbounded_channel();
        let (notifier, notifications) = mpsc::unbounded_channel();
        Self {
            actor: Actor {
                orchestrator,
                transport,
                clock,
                gate: ActivationGate::new(),
                timings,
                tx,
                notifier,
                heartbeat: None,
                satellite_reachable: false,
            },
            requests,
            notifications,
        }
    }

    pub fn handle(&self) -> AuthorityHandle {
        AuthorityHandle {
            tx: self.actor.tx.clone(),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            mut actor,
            mut requests,
            notifications,
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
                    let _ = tx.send(Request::Reachability(reachable));
                },
            )
        };
        let notifier = spawn_notifier(
            notifications,
            actor.transport.clone(),
            actor.gate.clone(),
            actor.timings.activation_timeout,
            cancel.child_token(),
        );
        info!("Authority runtime started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(request) = requests.recv() => {
                    actor.handle(request);
                    actor.execute();
                }
            }
        }

        actor.stop_heartbeat();
        let _ = probe.await;
        let _ = notifier.await;
        info!("Authority runtime stopped");
    }
}

impl<S, T, C> Actor<S, T, C>
where
    S: ClipStore,
    T: SatelliteTransport,
    C: Clock,
{
    fn handle(&mut self, request: Request) {
        match request {
            Request::StartSession { request, reply } => {
                let context = request.into_context(self.clock.now());
                let result = self
                    .orchestrator
                    .start_session(context.clone())
                    .map(|()| context);
                let _ = reply.send(result);
            }
            Request::StopSession { reply } => {
                let _ = reply.send(self.orchestrator.stop_session());
            }
            Request::State { reply } => {
                let state = self.orchestrator.reply_to_state_request();
                debug!("State request answered: {state:?}");
                let _ = reply.send(state);
            }
            Request::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    session: self.orchestrator.context().cloned(),
                    satellite_reachable: self.satellite_reachable,
                    link: self.gate.phase(),
                    ingested_clips: self.orchestrator.ingested_count(),
                });
            }
            Request::Ingest {
                ticket,
                file,
                reply,
            } => {
                let result = self.orchestrator.ingest(&ticket, file.as_deref());
                if let Err(e) = &result {
                    warn!("Ingest of {} failed: {e}", ticket.clip_id);
                }
                let _ = reply.send(result);
            }
            Request::Reachability(reachable) => {
                self.satellite_reachable = reachable;
                info!(
                    "Satellite {}",
                    if reachable { "reachable" } else { "unreachable" }
                );
            }
        }
    }

    fn execute(&mut self) {
        for command in self.orchestrator.take_commands() {
            match command {
                Command::StartHeartbeat => self.start_heartbeat(),
                Command::StopHeartbeat => self.stop_heartbeat(),
                Command::NotifySessionStarted(id) => {
                    let _ = self.notifier.send(Notification::Started(id));
                }
                Command::NotifySessionEnded => {
                    let _ = self.notifier.send(Notification::Ended);
                }
            }
        }
    }

    /// Heartbeats are skipped, not queued, while the link is not active.
    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.timings.heartbeat_interval;
        let transport = self.transport.clone();
        let gate = self.gate.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !gate.is_active() {
                    debug!("Link not active; heartbeat skipped");
                    continue;
                }
                if let Err(e) = transport.heartbeat().await {
                    debug!("Heartbeat failed: {e}");
                }
            }
            debug!("Heartbeat task stopped");
        });
        self.heartbeat = Some(token);
    }

    fn stop_heartbeat(&mut self) {
        if let Some(token) = self.heartbeat.take() {
            token.cancel();
        }
    }
}

/// Deliver session pushes one at a time, in order, each waiting behind the
/// activation gate.
fn spawn_notifier<T: SatelliteTransport>(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    transport: T,
    gate: ActivationGate,
    wait: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                n = notifications.recv() => match n {
                    Some(n) => n,
                    None => break,
                },
            };
            if let Err(e) = gate.wait_active(wait).await {
                warn!("{notification:?} not delivered: {e}");
                continue;
            }
            let result = match &notification {
                Notification::Started(id) => transport.notify_session_started(id).await,
                Notification::Ended => transport.notify_session_ended().await,
            };
            match result {
                Ok(()) => debug!("{notification:?} delivered"),
                Err(e) => warn!("{notification:?} not delivered: {e}"),
            }
        }
    })
}

//! In-process link between an authority and a satellite.
//!
//! Used where no real file-transfer primitive exists (test harnesses,
//! single-process demos): clip transfers carry the ticket metadata only,
//! never the audio file.  A shared [`LinkSwitch`] simulates the radio link
//! going down and coming back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::link::LinkError;
use crate::protocol::{ClipTicket, SessionStarted, StateReply, TransferReceipt};

/// Authority → satellite messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToSatellite {
    Heartbeat,
    SessionStarted(SessionStarted),
    SessionEnded,
}

/// Satellite → authority messages.  Each carries its reply channel.
#[derive(Debug)]
pub enum ToAuthority {
    StateRequest {
        reply: oneshot::Sender<StateReply>,
    },
    ClipTransfer {
        ticket: ClipTicket,
        reply: oneshot::Sender<Result<TransferReceipt, String>>,
    },
}

/// Simulated radio link state shared by both ends.
#[derive(Debug, Clone)]
pub struct LinkSwitch(Arc<AtomicBool>);

impl LinkSwitch {
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn sever(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Sending half of one direction of the in-process link.
#[derive(Debug)]
pub struct MemoryLink<T> {
    tx: mpsc::Sender<T>,
    switch: LinkSwitch,
}

impl<T> Clone for MemoryLink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            switch: self.switch.clone(),
        }
    }
}

impl<T> MemoryLink<T> {
    pub fn is_reachable(&self) -> bool {
        self.switch.is_up() && !self.tx.is_closed()
    }

    pub async fn send(&self, msg: T) -> Result<(), LinkError> {
        if !self.switch.is_up() {
            return Err(LinkError::Unreachable("in-memory link severed".into()));
        }
        self.tx.send(msg).await.map_err(|_| LinkError::Closed)
    }
}

/// Both directions of an in-process link.
pub struct MemoryPair {
    pub to_satellite: MemoryLink<ToSatellite>,
    pub satellite_inbox: mpsc::Receiver<ToSatellite>,
    pub to_authority: MemoryLink<ToAuthority>,
    pub authority_inbox: mpsc::Receiver<ToAuthority>,
    pub switch: LinkSwitch,
}

pub fn pair(capacity: usize) -> MemoryPair {
    let switch = LinkSwitch(Arc::new(AtomicBool::new(true)));
    let (sat_tx, sat_rx) = mpsc::channel(capacity);
    let (auth_tx, auth_rx) = mpsc::channel(capacity);
    MemoryPair {
        to_satellite: MemoryLink {
            tx: sat_tx,
            switch: switch.clone(),
        },
        satellite_inbox: sat_rx,
        to_authority: MemoryLink {
            tx: auth_tx,
            switch: switch.clone(),
        },
        authority_inbox: auth_rx,
        switch,
    }
}

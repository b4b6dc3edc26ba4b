//! Authority and satellite actors wired together over the in-memory link.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use touchline_authority::archive::{read_index, ArchiveStore};
use touchline_authority::orchestrator::Orchestrator;
use touchline_authority::runtime::{self as authority_rt, AuthorityHandle, AuthorityRuntime};
use touchline_authority::session::StartSessionRequest;
use touchline_authority::transport::{self as authority_tx, MemorySatellite};
use touchline_common::clock::VirtualClock;
use touchline_common::config::Config;
use touchline_common::memory::{self, LinkSwitch};
use touchline_satellite::capture::SilentDevice;
use touchline_satellite::runtime::{self as satellite_rt, Event, SatelliteHandle, SatelliteRuntime};
use touchline_satellite::satellite::Satellite;
use touchline_satellite::state::{LossReason, Notice, StatusSnapshot};
use touchline_satellite::transfer::TransferQueue;
use touchline_satellite::transport::{self as satellite_tx, MemoryAuthority};
use touchline_satellite::watchdog::Watchdog;

struct Loopback {
    authority: AuthorityHandle,
    satellite: SatelliteHandle,
    status: watch::Receiver<StatusSnapshot>,
    switch: LinkSwitch,
    cancel: CancellationToken,
}

fn wire(archive: &Path, scratch: &Path) -> Loopback {
    let config = Config::default();
    let pair = memory::pair(64);
    let anchor = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let cancel = CancellationToken::new();

    let authority = AuthorityRuntime::new(
        Orchestrator::new(ArchiveStore::new(archive)),
        MemorySatellite::new(pair.to_satellite),
        VirtualClock::starting_at(anchor),
        authority_rt::Timings::from(&config),
    );
    let authority_handle = authority.handle();
    authority_tx::spawn_memory_inbox(pair.authority_inbox, authority_handle.clone());
    tokio::spawn(authority.run(cancel.clone()));

    let satellite = SatelliteRuntime::new(
        Satellite::new(
            SilentDevice::new(scratch),
            TransferQueue::new(scratch, &config.auxiliary_label, 0),
            Watchdog::new(config.watchdog_timeout),
        ),
        MemoryAuthority::new(pair.to_authority),
        VirtualClock::starting_at(anchor),
        satellite_rt::Timings::from(&config),
    );
    let satellite_handle = satellite.handle();
    let status = satellite.status();
    satellite_tx::spawn_memory_inbox(pair.satellite_inbox, satellite_handle.clone());
    tokio::spawn(satellite.run(cancel.clone()));

    Loopback {
        authority: authority_handle,
        satellite: satellite_handle,
        status,
        switch: pair.switch,
        cancel,
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn start_request() -> StartSessionRequest {
    StartSessionRequest {
        session_id: Some("S1".into()),
        team_id: "U12-blue".into(),
        roster: BTreeSet::from(["p3".to_string(), "p7".to_string()]),
        owner_id: "coach-1".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn session_follows_the_authority_across_a_dropout() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("archive");
    let scratch = tmp.path().join("scratch");
    let link = wire(&archive, &scratch);
    sleep_ms(100).await;
    assert!(link.status.borrow().reachable);
    assert!(!link.status.borrow().session_active);

    // Start on the phone; the wearable follows.
    link.authority.start_session(start_request()).await.unwrap();
    sleep_ms(200).await;
    assert_eq!(link.status.borrow().session_id.as_deref(), Some("S1"));

    // Heartbeats keep a long capture alive.
    assert!(link.satellite.toggle().await.unwrap());
    sleep_ms(7_000).await;
    assert!(link.status.borrow().session_active);
    assert!(!link.satellite.toggle().await.unwrap());
    sleep_ms(100).await;

    let entries = read_index(&archive.join("S1")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.team_id, "U12-blue");
    assert_eq!(entries[0].record.auxiliary_label, "watch");
    assert!(entries[0].record.offset_start_secs > 0.0);
    assert!(entries[0].record.offset_end_secs > entries[0].record.offset_start_secs);
    assert_eq!(link.status.borrow().outstanding_transfers, 0);
    assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);

    // Dropout: the wearable stops at once, the phone keeps its session.
    link.switch.sever();
    sleep_ms(1_500).await;
    let status = link.status.borrow().clone();
    assert!(!status.session_active);
    assert_eq!(
        status.notice,
        Some(Notice::ConnectionLost {
            reason: LossReason::Disconnected
        })
    );
    assert!(link.authority.state().await.unwrap().session_active);

    // Back in range: reconciliation restores the session.
    link.switch.restore();
    sleep_ms(2_000).await;
    let status = link.status.borrow().clone();
    assert!(status.session_active);
    assert_eq!(status.session_id.as_deref(), Some("S1"));
    assert_eq!(
        status.notice,
        Some(Notice::ConnectionLost {
            reason: LossReason::Disconnected
        })
    );
    link.satellite.post(Event::DismissNotice).unwrap();
    sleep_ms(100).await;
    assert!(link.status.borrow().notice.is_none());

    // And it stays up on heartbeats alone.
    sleep_ms(8_000).await;
    assert!(link.status.borrow().session_active);

    link.authority.stop_session().await.unwrap();
    sleep_ms(200).await;
    assert!(!link.status.borrow().session_active);

    link.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn wearable_launched_mid_session_adopts_it() {
    let tmp = tempfile::tempdir().unwrap();
    let link = wire(&tmp.path().join("archive"), &tmp.path().join("scratch"));

    link.authority.start_session(start_request()).await.unwrap();
    sleep_ms(1_500).await;

    let status = link.status.borrow().clone();
    assert!(status.session_active);
    assert_eq!(status.session_id.as_deref(), Some("S1"));
    link.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn toggle_without_session_records_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("archive");
    let link = wire(&archive, &tmp.path().join("scratch"));
    sleep_ms(100).await;

    assert!(!link.satellite.toggle().await.unwrap());
    sleep_ms(100).await;
    assert!(!link.status.borrow().recording);
    assert!(!archive.exists());
    link.cancel.cancel();
}

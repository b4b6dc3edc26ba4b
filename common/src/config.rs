//! Configuration parsing – reads a KEY=VALUE file (`touchline.conf`).
//!
//! The authority and the satellite load the same format; each ignores the
//! fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Which capture backend the satellite drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDeviceKind {
    /// `arecord` child process writing WAV into the scratch directory.
    Arecord,
    /// Silent WAV written with `hound`, for hosts without a microphone.
    Silent,
}

impl FromStr for CaptureDeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arecord" | "alsa" => Ok(Self::Arecord),
            "silent" | "synthetic" => Ok(Self::Silent),
            other => anyhow::bail!("Unknown CAPTURE_DEVICE '{other}' (expected arecord|silent)"),
        }
    }
}

/// Application configuration, shared between authority and satellite.
#[derive(Debug, Clone)]
pub struct Config {
    // ── network ──────────────────────────────────────────────────────
    /// Address the authority HTTP server listens on.
    pub authority_listen_addr: String,
    /// URL the satellite uses to reach the authority (mDNS fallback).
    pub authority_url: String,
    /// Address the satellite HTTP server listens on.
    pub satellite_listen_addr: String,
    /// URL the authority uses to reach the satellite (mDNS fallback).
    pub satellite_url: String,

    // ── link timing ──────────────────────────────────────────────────
    pub heartbeat_interval: Duration,
    pub watchdog_timeout: Duration,
    pub watchdog_tick: Duration,
    /// How often the satellite refreshes its displayed duration/status.
    pub duration_poll: Duration,
    /// How often each side probes its peer's reachability.
    pub probe_interval: Duration,
    /// How long a send may wait behind the activation gate.
    pub activation_timeout: Duration,

    // ── satellite ────────────────────────────────────────────────────
    pub scratch_dir: PathBuf,
    pub capture_device: CaptureDeviceKind,
    pub rec_card: Option<String>,
    pub channels: u16,
    pub auxiliary_label: String,
    /// Tickets held while unreachable; 0 keeps transfers best-effort.
    pub transfer_retry_capacity: usize,

    // ── authority ────────────────────────────────────────────────────
    pub archive_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/touchline/touchline.conf"
    }

    /// Where the authority parks uploads before they are archived.
    pub fn incoming_dir(&self) -> PathBuf {
        self.archive_dir.join("incoming")
    }

    /// The watchdog must outlast at least one heartbeat interval, or it
    /// fires between two on-time heartbeats.
    pub fn heartbeat_margin_ok(&self) -> bool {
        self.heartbeat_interval < self.watchdog_timeout
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text));
    info!("Loaded config from {}", path.display());

    if !config.heartbeat_margin_ok() {
        warn!(
            "HEARTBEAT_INTERVAL_MS={} is not below WATCHDOG_TIMEOUT_MS={}; \
             the watchdog will stop sessions between on-time heartbeats",
            config.heartbeat_interval.as_millis(),
            config.watchdog_timeout.as_millis(),
        );
    }
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_ms = |key: &str, default: u64| -> Duration {
        Duration::from_millis(get(key).and_then(|v| v.parse().ok()).unwrap_or(default))
    };

    let capture_device = match get("CAPTURE_DEVICE").map(|v| v.parse::<CaptureDeviceKind>()) {
        Some(Ok(kind)) => kind,
        Some(Err(e)) => {
            warn!("{e:#}; falling back to arecord");
            CaptureDeviceKind::Arecord
        }
        None => CaptureDeviceKind::Arecord,
    };

    Config {
        authority_listen_addr: get("AUTHORITY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8090".into()),
        authority_url: get("AUTHORITY_URL").unwrap_or_else(|| "http://authority:8090".into()),
        satellite_listen_addr: get("SATELLITE_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8091".into()),
        satellite_url: get("SATELLITE_URL").unwrap_or_else(|| "http://satellite:8091".into()),

        heartbeat_interval: get_ms("HEARTBEAT_INTERVAL_MS", 2_000),
        watchdog_timeout: get_ms("WATCHDOG_TIMEOUT_MS", 3_000),
        watchdog_tick: get_ms("WATCHDOG_TICK_MS", 2_000),
        duration_poll: get_ms("DURATION_POLL_MS", 500),
        probe_interval: get_ms("PROBE_INTERVAL_MS", 1_000),
        activation_timeout: get_ms("ACTIVATION_TIMEOUT_MS", 10_000),

        scratch_dir: PathBuf::from(get("SCRATCH_DIR").unwrap_or_else(|| "/data/scratch".into())),
        capture_device,
        rec_card: get("REC_CARD").filter(|s| !s.is_empty()),
        channels: get("CHANNELS").and_then(|v| v.parse().ok()).unwrap_or(1),
        auxiliary_label: get("AUXILIARY_LABEL").unwrap_or_else(|| "watch".into()),
        transfer_retry_capacity: get("TRANSFER_RETRY_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),

        archive_dir: PathBuf::from(get("ARCHIVE_DIR").unwrap_or_else(|| "/data/archive".into())),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            map.insert(key.trim().to_string(), val.trim().trim_matches('"').to_string());
        }
    }
    map
}

/// Port component of a `host:port` listen address, for mDNS registration.
pub fn listen_port(addr: &str) -> u16 {
    addr.rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
AUTHORITY_URL="http://192.168.1.20:8090"
HEARTBEAT_INTERVAL_MS=1500
AUXILIARY_LABEL = "coach watch"
"#;
        let map = parse_conf(text);
        assert_eq!(map["AUTHORITY_URL"], "http://192.168.1.20:8090");
        assert_eq!(map["HEARTBEAT_INTERVAL_MS"], "1500");
        assert_eq!(map["AUXILIARY_LABEL"], "coach watch");
    }

    #[test]
    fn test_defaults_match_link_contract() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.watchdog_timeout, Duration::from_secs(3));
        assert_eq!(config.watchdog_tick, Duration::from_secs(2));
        assert_eq!(config.transfer_retry_capacity, 0);
        assert_eq!(config.capture_device, CaptureDeviceKind::Arecord);
        assert!(config.heartbeat_margin_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("touchline.conf");
        std::fs::write(
            &path,
            "SCRATCH_DIR=/tmp/clips\nCAPTURE_DEVICE=silent\nTRANSFER_RETRY_CAPACITY=4\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp/clips"));
        assert_eq!(config.capture_device, CaptureDeviceKind::Silent);
        assert_eq!(config.transfer_retry_capacity, 4);
    }

    #[test]
    fn test_heartbeat_margin() {
        let inverted = from_map(&parse_conf("HEARTBEAT_INTERVAL_MS=3000\nWATCHDOG_TIMEOUT_MS=3000\n"));
        assert!(!inverted.heartbeat_margin_ok());

        let tight = from_map(&parse_conf("HEARTBEAT_INTERVAL_MS=1000\nWATCHDOG_TIMEOUT_MS=3000\n"));
        assert!(tight.heartbeat_margin_ok());
    }

    #[test]
    fn test_listen_port() {
        assert_eq!(listen_port("0.0.0.0:8091"), 8091);
        assert_eq!(listen_port("[::]:9000"), 9000);
        assert_eq!(listen_port("nonsense"), 0);
    }
}

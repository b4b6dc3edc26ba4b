//! mDNS-SD pairing between the authority and its satellite.
//!
//! Each node registers itself on the local network as
//! `<role>-NN._touchline-<role>._tcp.local.` and can browse for its peer,
//! so neither side needs a hard-coded URL when both are on the same LAN.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{info, warn};

/// How long to scan for existing instances before claiming a number.
const REGISTRATION_SCAN: Duration = Duration::from_secs(2);

/// Set to skip mDNS entirely (CI, bridge networking).
pub const DISABLE_ENV: &str = "TOUCHLINE_DISABLE_MDNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Satellite,
}

impl Role {
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::Authority => "_touchline-authority._tcp.local.",
            Self::Satellite => "_touchline-satellite._tcp.local.",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Authority => "authority",
            Self::Satellite => "satellite",
        }
    }

    /// The role this node pairs with.
    pub fn peer(&self) -> Role {
        match self {
            Self::Authority => Self::Satellite,
            Self::Satellite => Self::Authority,
        }
    }
}

/// A node seen on the network.
#[derive(Debug, Clone)]
pub struct Peer {
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl Peer {
    /// HTTP base URL, preferring a non-loopback IPv4 address.
    pub fn http_url(&self) -> Option<String> {
        let addr = self
            .addresses
            .iter()
            .find(|a| a.is_ipv4() && !a.is_loopback())
            .or_else(|| self.addresses.iter().find(|a| a.is_ipv4()))
            .or_else(|| self.addresses.first())?;

        Some(match addr {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.port),
        })
    }
}

/// Keeps the mDNS registration alive.
pub struct Registration {
    daemon: ServiceDaemon,
    role: Role,
    fullname: String,
}

impl Registration {
    /// Browse for our peer role for up to `timeout`.  Returns the first
    /// resolved peer; only one paired satellite per authority is supported.
    pub fn find_peer(&self, timeout: Duration) -> Option<Peer> {
        let role = self.role.peer();
        let receiver = match self.daemon.browse(role.service_type()) {
            Ok(r) => r,
            Err(e) => {
                warn!("mDNS browse for {} failed: {e}", role.service_type());
                return None;
            }
        };

        let deadline = Instant::now() + timeout;
        let mut found = None;
        while found.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let name = info.get_fullname().to_string();
                    if name == self.fullname {
                        continue;
                    }
                    let addresses: Vec<IpAddr> =
                        info.get_addresses().iter().map(|a| a.to_ip_addr()).collect();
                    info!("mDNS: found {} at {:?}:{}", name, addresses, info.get_port());
                    found = Some(Peer {
                        instance_name: instance_of(&name).to_string(),
                        addresses,
                        port: info.get_port(),
                    });
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        let _ = self.daemon.stop_browse(role.service_type());
        found
    }

    /// Unregister and stop the daemon.
    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Register this node under the next free `<role>-NN` instance name.
pub fn register(role: Role, port: u16) -> Result<Registration> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;

    let receiver = daemon
        .browse(role.service_type())
        .context("Cannot browse mDNS")?;
    let mut taken: BTreeSet<u32> = BTreeSet::new();
    let deadline = Instant::now() + REGISTRATION_SCAN;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(n) = instance_number(info.get_fullname(), role.prefix()) {
                    taken.insert(n);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = daemon.stop_browse(role.service_type());

    let instance_name = format!("{}-{:02}", role.prefix(), lowest_free(&taken));
    let host = format!("{instance_name}.local.");
    let service_info = ServiceInfo::new(role.service_type(), &instance_name, &host, "", port, None)
        .context("Cannot create mDNS ServiceInfo")?
        .enable_addr_auto();
    let fullname = service_info.get_fullname().to_string();

    daemon
        .register(service_info)
        .context("Cannot register mDNS service")?;
    info!("Registered on mDNS as '{instance_name}' (port={port})");

    Ok(Registration {
        daemon,
        role,
        fullname,
    })
}

/// Resolve the peer's base URL via mDNS, falling back to `fallback` when
/// discovery is disabled or finds nothing.  Blocking; call from
/// `spawn_blocking` inside async code.
pub fn resolve_peer_url(
    registration: Option<&Registration>,
    timeout: Duration,
    fallback: &str,
) -> String {
    registration
        .and_then(|r| r.find_peer(timeout))
        .and_then(|peer| peer.http_url())
        .unwrap_or_else(|| {
            info!("Using configured peer URL {fallback}");
            fallback.to_string()
        })
}

fn instance_of(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

fn instance_number(fullname: &str, prefix: &str) -> Option<u32> {
    instance_of(fullname)
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

fn lowest_free(taken: &BTreeSet<u32>) -> u32 {
    (1..).find(|n| !taken.contains(n)).unwrap_or(1)
}

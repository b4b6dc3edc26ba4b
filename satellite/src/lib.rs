//! The wearable side of a touchline link: session cache, heartbeat
//! watchdog, capture and clip hand-off.

pub mod capture;
pub mod recorder;
pub mod runtime;
pub mod satellite;
pub mod server;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod watchdog;

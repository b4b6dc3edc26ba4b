//! The phone side of a touchline link: owns the session, emits heartbeats
//! and files the clips the satellite hands over.

pub mod archive;
pub mod orchestrator;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transport;

//! Types and plumbing shared by the touchline authority and satellite.

pub mod clock;
pub mod config;
pub mod discovery;
pub mod link;
pub mod memory;
pub mod protocol;

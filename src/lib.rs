//! onionlink - Tor client supervisor.
//!
//! Launches a tor client, drives it through bootstrap over the control
//! port, and falls back through pluggable transports when bootstrap stalls.

pub mod autoconf;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod locate;
pub mod network;
pub mod orchestrator;
pub mod provision;
pub mod sibling;
pub mod stall;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::ConnectError;
pub use network::IpStatus;
pub use orchestrator::{
    ConnectionOrchestrator, OrchestratorParts, SocksEndpoint, StartOptions, Timing,
};
pub use store::SettingsStore;
pub use transport::Transport;

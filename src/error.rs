//! Error types for connection orchestration.

use thiserror::Error;

use crate::client::LaunchError;
use crate::control::ControlError;
use crate::transport::TransportError;

/// Errors surfaced by [`ConnectionOrchestrator::start`](crate::ConnectionOrchestrator::start).
///
/// Every variant returned from `start` has already been preceded by a full
/// teardown, so no half-started process or control channel is left behind.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A sibling Tor application is running and offers no bypass port.
    /// Starting our own client would nest two Tor layers.
    #[error("another Tor application is running and offers no bypass port")]
    SiblingRunningNoBypass,

    #[error("could not read the control port authentication cookie")]
    CookieUnreadable,

    #[error("tor reported no usable SOCKS listener")]
    NoSocksAddr,

    /// Every transport in the cascade stalled without building a circuit.
    #[error("smart connect exhausted all transports without a circuit")]
    SmartConnectFailed,

    #[error("a start is already in progress")]
    StartInProgress,

    /// `stop()` ran while this start was still in flight.
    #[error("start was cancelled by stop")]
    Cancelled,

    #[error("failed to launch tor: {0}")]
    Launch(#[from] LaunchError),

    #[error("control port error: {0}")]
    Control(#[from] ControlError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

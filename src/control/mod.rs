//! Tor control channel.
//!
//! [`ControlChannel`] is the seam between the orchestrator and a running tor
//! process. [`TorControlConnection`] speaks the control protocol over TCP;
//! tests substitute an in-memory fake.

mod connection;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::ClientConfiguration;

pub use connection::{TorControlConnection, TorControlConnector};

/// Control channel errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control port file {0} is missing or malformed")]
    PortFile(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("tor rejected command ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("malformed reply: {0}")]
    Protocol(String),
}

/// Identifies an observer registered on a control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// An observer registration. Events arrive on `events` until the observer
/// is removed, at which point the stream ends.
#[derive(Debug)]
pub struct Subscription<T> {
    pub id: ObserverId,
    pub events: mpsc::UnboundedReceiver<T>,
}

/// A `STATUS_*` asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// `STATUS_CLIENT`, `STATUS_GENERAL` or `STATUS_SERVER`.
    pub kind: String,
    pub severity: String,
    pub action: String,
    pub args: HashMap<String, String>,
}

impl StatusEvent {
    /// Bootstrap percentage, if this is a `BOOTSTRAP` event.
    pub fn bootstrap_progress(&self) -> Option<u8> {
        if self.kind != "STATUS_CLIENT" || self.action != "BOOTSTRAP" {
            return None;
        }
        self.args
            .get("PROGRESS")
            .and_then(|p| p.parse::<u8>().ok())
            .map(|p| p.min(100))
    }

    /// Circuit establishment state carried by this event.
    pub fn circuit_established(&self) -> Option<bool> {
        if self.kind != "STATUS_CLIENT" {
            return None;
        }
        match self.action.as_str() {
            "CIRCUIT_ESTABLISHED" => Some(true),
            "CIRCUIT_NOT_ESTABLISHED" => Some(false),
            _ => None,
        }
    }
}

/// A relay in a circuit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitNode {
    pub fingerprint: String,
    pub nickname: Option<String>,
}

/// A circuit as reported by `GETINFO circuit-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: String,
    pub status: String,
    pub path: Vec<CircuitNode>,
    pub purpose: Option<String>,
    pub time_created: Option<NaiveDateTime>,
}

/// Administrative connection to a running tor.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn connect(&self) -> Result<(), ControlError>;

    fn is_connected(&self) -> bool;

    async fn authenticate(&self, cookie: &[u8]) -> Result<(), ControlError>;

    fn add_status_observer(&self) -> Subscription<StatusEvent>;

    fn add_circuit_observer(&self) -> Subscription<bool>;

    /// Remove an observer. Unknown ids are ignored.
    fn remove_observer(&self, id: ObserverId);

    /// Values for `keys`, in the same order.
    async fn get_info(&self, keys: &[&str]) -> Result<Vec<String>, ControlError>;

    async fn set_confs(&self, confs: &[(String, String)]) -> Result<(), ControlError>;

    async fn reset_conf(&self, key: &str) -> Result<(), ControlError>;

    /// Ask tor to switch to clean circuits for new connections.
    async fn reset_connection(&self) -> Result<(), ControlError>;

    async fn disconnect(&self);

    async fn get_circuits(&self) -> Result<Vec<Circuit>, ControlError>;

    /// Close circuits. Returns `true` if every close succeeded.
    async fn close_circuits(&self, circuits: &[Circuit]) -> Result<bool, ControlError>;
}

/// Creates control channels for a launched tor.
pub trait ControlConnector: Send + Sync {
    fn open(&self, config: &ClientConfiguration) -> Arc<dyn ControlChannel>;
}

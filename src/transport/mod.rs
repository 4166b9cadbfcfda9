//! Circumvention transports and their local helpers.
//!
//! A [`Transport`] is the user-visible choice; each one except
//! [`Transport::None`] is backed by one of two local helpers (obfs4 or
//! snowflake). The two helpers are mutually exclusive: [`TransportSet`] makes
//! sure only the family in use is running.

pub mod bridges;
mod managed;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use managed::{ManagedTransport, PtMessage};

/// Circumvention transport selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Direct connection to public relays.
    #[default]
    None,
    /// WebRTC via volunteer proxies, broker reached through domain fronting
    Snowflake,
    /// Snowflake with the broker reached through the AMP cache
    #[value(name = "snowflake-amp")]
    SnowflakeAmp,
    /// obfs4 with the built-in bridges
    Obfs4,
    /// obfs4 with user-supplied bridge lines
    Custom,
}

/// The two local helper families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    Obfs4,
    Snowflake,
}

impl HelperKind {
    /// Method name as used in `ClientTransportPlugin` and bridge lines.
    pub fn method(&self) -> &'static str {
        match self {
            HelperKind::Obfs4 => "obfs4",
            HelperKind::Snowflake => "snowflake",
        }
    }
}

impl Transport {
    /// Position in the smart-connect cascade. Snowflake variants share a slot.
    pub fn cascade_position(&self) -> u8 {
        match self {
            Transport::None => 0,
            Transport::Snowflake | Transport::SnowflakeAmp => 1,
            Transport::Custom => 2,
            Transport::Obfs4 => 3,
        }
    }

    /// Whether this transport needs a locally running helper.
    pub fn needs_helper(&self) -> bool {
        self.helper().is_some()
    }

    /// Helper family backing this transport.
    pub fn helper(&self) -> Option<HelperKind> {
        match self {
            Transport::None => None,
            Transport::Obfs4 | Transport::Custom => Some(HelperKind::Obfs4),
            Transport::Snowflake | Transport::SnowflakeAmp => Some(HelperKind::Snowflake),
        }
    }

    /// Bridge lines this transport uses.
    pub fn bridge_lines(&self, custom_bridges: &[String]) -> Vec<String> {
        let builtin: &[&str] = match self {
            Transport::None => &[],
            Transport::Obfs4 => bridges::OBFS4,
            Transport::Snowflake => bridges::SNOWFLAKE,
            Transport::SnowflakeAmp => bridges::SNOWFLAKE_AMP,
            Transport::Custom => return custom_bridges.to_vec(),
        };
        builtin.iter().map(|s| s.to_string()).collect()
    }

    /// Configuration options (key, value) activating this transport.
    ///
    /// `helper_port` is the SOCKS port of the running helper. `Bridge` appears
    /// once per line, so the result is an ordered list rather than a map.
    pub fn config_options(
        &self,
        helper_port: Option<u16>,
        custom_bridges: &[String],
    ) -> Vec<(String, String)> {
        let Some(kind) = self.helper() else {
            return Vec::new();
        };

        let mut options = Vec::new();
        match helper_port {
            Some(port) => options.push((
                "ClientTransportPlugin".to_string(),
                format!("{} socks5 127.0.0.1:{}", kind.method(), port),
            )),
            None => tracing::warn!("{} helper is not running, omitting transport plugin", kind.method()),
        }
        for line in self.bridge_lines(custom_bridges) {
            options.push(("Bridge".to_string(), line));
        }
        options
    }

    /// The same fragment in command-line form (`--Key value` pairs).
    pub fn arguments(&self, helper_port: Option<u16>, custom_bridges: &[String]) -> Vec<String> {
        self.config_options(helper_port, custom_bridges)
            .into_iter()
            .flat_map(|(key, value)| [format!("--{}", key), value])
            .collect()
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::None => write!(f, "none"),
            Transport::Snowflake => write!(f, "snowflake"),
            Transport::SnowflakeAmp => write!(f, "snowflake-amp"),
            Transport::Obfs4 => write!(f, "obfs4"),
            Transport::Custom => write!(f, "custom"),
        }
    }
}

/// Errors from starting a transport helper.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} binary not found")]
    BinaryNotFound(&'static str),
    #[error("failed to spawn helper: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("helper does not speak managed proxy version 1")]
    VersionMismatch,
    #[error("helper failed to start {method}: {message}")]
    Method { method: String, message: String },
    #[error("helper exited before reporting its listener")]
    Exited,
    #[error("timed out waiting for helper listener")]
    Timeout,
    #[error("malformed helper output: {0}")]
    Malformed(String),
}

/// A local pluggable transport helper.
#[async_trait]
pub trait TransportHelper: Send + Sync {
    /// Start the helper. Starting an already running helper is a no-op.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stop the helper. Stopping a stopped helper is a no-op.
    async fn stop(&self);

    /// SOCKS port the running helper listens on.
    fn local_port(&self) -> Option<u16>;

    fn is_running(&self) -> bool;
}

/// The obfs4 and snowflake helpers, one instance per kind.
#[derive(Clone)]
pub struct TransportSet {
    obfs4: Arc<dyn TransportHelper>,
    snowflake: Arc<dyn TransportHelper>,
}

impl TransportSet {
    pub fn new(obfs4: Arc<dyn TransportHelper>, snowflake: Arc<dyn TransportHelper>) -> Self {
        Self { obfs4, snowflake }
    }

    pub fn helper(&self, kind: HelperKind) -> &Arc<dyn TransportHelper> {
        match kind {
            HelperKind::Obfs4 => &self.obfs4,
            HelperKind::Snowflake => &self.snowflake,
        }
    }

    /// Start the helper backing `transport` (no-op for [`Transport::None`]).
    pub async fn start(&self, transport: Transport) -> Result<(), TransportError> {
        match transport.helper() {
            Some(kind) => {
                tracing::info!("Starting {} helper for {}", kind.method(), transport);
                self.helper(kind).start().await
            }
            None => Ok(()),
        }
    }

    /// Stop the helper backing `transport`.
    pub async fn stop(&self, transport: Transport) {
        if let Some(kind) = transport.helper() {
            self.helper(kind).stop().await;
        }
    }

    /// Stop every helper family `transport` does not use.
    ///
    /// For [`Transport::None`] this stops both.
    pub async fn stop_others(&self, transport: Transport) {
        let keep = transport.helper();
        for kind in [HelperKind::Obfs4, HelperKind::Snowflake] {
            if keep != Some(kind) {
                self.helper(kind).stop().await;
            }
        }
    }

    fn port_for(&self, transport: Transport) -> Option<u16> {
        transport
            .helper()
            .and_then(|kind| self.helper(kind).local_port())
    }

    /// Configuration options for `transport` using the live helper port.
    pub fn config_options(
        &self,
        transport: Transport,
        custom_bridges: &[String],
    ) -> Vec<(String, String)> {
        transport.config_options(self.port_for(transport), custom_bridges)
    }

    /// Command-line arguments for `transport` using the live helper port.
    pub fn arguments(&self, transport: Transport, custom_bridges: &[String]) -> Vec<String> {
        transport.arguments(self.port_for(transport), custom_bridges)
    }
}

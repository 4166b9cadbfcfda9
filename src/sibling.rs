//! Detection of a co-resident Tor application.
//!
//! If another app on the device already runs Tor, starting our own client on
//! top of it would tunnel Tor through Tor. Such a sibling may offer a bypass
//! SOCKS port that our tor can use as its upstream proxy instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Upper bound for a sibling probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiblingStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl SiblingStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SiblingStatus::Starting | SiblingStatus::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingInfo {
    pub status: SiblingStatus,
    #[serde(default)]
    pub bypass_port: Option<u16>,
}

impl SiblingInfo {
    pub fn stopped() -> Self {
        Self {
            status: SiblingStatus::Stopped,
            bypass_port: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SiblingError {
    #[error("invalid sibling API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("sibling API returned HTTP {status}")]
    Http { status: u16 },
    #[error("sibling API request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Access to a sibling app's status.
#[async_trait]
pub trait SiblingDiscovery: Send + Sync {
    /// Whether a sibling discovery API is configured at all.
    fn installed(&self) -> bool;

    async fn info(&self) -> Result<SiblingInfo, SiblingError>;
}

/// No sibling discovery configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSibling;

#[async_trait]
impl SiblingDiscovery for NoSibling {
    fn installed(&self) -> bool {
        false
    }

    async fn info(&self) -> Result<SiblingInfo, SiblingError> {
        Ok(SiblingInfo::stopped())
    }
}

/// Sibling reached through a local HTTP status API.
#[derive(Debug, Clone)]
pub struct LocalApiSibling {
    client: reqwest::Client,
    status_url: Url,
    token: Option<String>,
}

impl LocalApiSibling {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, SiblingError> {
        let status_url = Url::parse(&format!("{}/status", base_url.trim_end_matches('/')))?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            status_url,
            token,
        })
    }
}

#[async_trait]
impl SiblingDiscovery for LocalApiSibling {
    fn installed(&self) -> bool {
        true
    }

    async fn info(&self) -> Result<SiblingInfo, SiblingError> {
        let mut request = self.client.get(self.status_url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                debug!("Sibling API not listening: {}", e);
                return Ok(SiblingInfo::stopped());
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SiblingError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Outcome of a sibling probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiblingProbe {
    pub running: bool,
    pub bypass_port: Option<u16>,
}

/// Bounded sibling probe.
#[derive(Clone)]
pub struct SiblingDetector {
    discovery: Arc<dyn SiblingDiscovery>,
    timeout: Duration,
}

impl SiblingDetector {
    pub fn new(discovery: Arc<dyn SiblingDiscovery>) -> Self {
        Self {
            discovery,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn evaluate(&self) -> SiblingProbe {
        if !self.discovery.installed() {
            return SiblingProbe::default();
        }

        match tokio::time::timeout(self.timeout, self.discovery.info()).await {
            Ok(Ok(info)) => SiblingProbe {
                running: info.status.is_running(),
                bypass_port: info.bypass_port,
            },
            // The sibling refuses to talk to us, but it is there.
            Ok(Err(SiblingError::Http { status: 403 })) => SiblingProbe {
                running: true,
                bypass_port: None,
            },
            Ok(Err(e)) => {
                warn!("Sibling probe failed: {}", e);
                SiblingProbe::default()
            }
            Err(_) => {
                debug!("Sibling probe timed out after {:?}", self.timeout);
                SiblingProbe::default()
            }
        }
    }
}

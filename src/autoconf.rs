//! Automatic transport selection through the circumvention settings service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::SettingsStore;
use crate::transport::Transport;

pub const DEFAULT_SETTINGS_URL: &str =
    "https://bridges.torproject.org/moat/circumvention/settings";

#[derive(Debug, Error)]
pub enum AutoConfError {
    #[error("settings request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("settings service returned HTTP {status}")]
    Http { status: u16 },
    #[error("settings service error: {0}")]
    Service(String),
    #[error("settings service suggested {0}, which is not supported")]
    Unsupported(String),
}

/// Picks a transport (and possibly bridges) for the current network.
#[async_trait]
pub trait AutoConfigure: Send + Sync {
    /// Update the stored transport and custom bridges.
    async fn perform(&self, settings: &dyn SettingsStore) -> Result<(), AutoConfError>;
}

#[derive(Debug, Serialize)]
struct SettingsRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
    transports: &'a [&'a str],
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsResponse {
    #[serde(default)]
    pub settings: Option<Vec<Setting>>,
    #[serde(default)]
    pub errors: Option<Vec<ServiceError>>,
}

#[derive(Debug, Deserialize)]
pub struct Setting {
    pub bridges: BridgeSetting,
}

#[derive(Debug, Deserialize)]
pub struct BridgeSetting {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub bridge_strings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub detail: String,
}

/// Transport (and bridges, for [`Transport::Custom`]) to switch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub transport: Transport,
    pub bridges: Vec<String>,
}

/// Map a settings response to a selection. The first setting wins.
pub fn select(response: SettingsResponse) -> Result<Selection, AutoConfError> {
    if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
        let message = errors
            .iter()
            .map(|e| format!("{} {}", e.code, e.detail))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AutoConfError::Service(message));
    }

    let Some(first) = response.settings.and_then(|s| s.into_iter().next()) else {
        return Ok(Selection {
            transport: Transport::None,
            bridges: Vec::new(),
        });
    };

    let bridges = first.bridges;
    let transport = match bridges.kind.as_str() {
        "snowflake" => Transport::Snowflake,
        "obfs4" if bridges.source == "builtin" => Transport::Obfs4,
        "obfs4" if !bridges.bridge_strings.is_empty() => Transport::Custom,
        "obfs4" => Transport::Obfs4,
        other => return Err(AutoConfError::Unsupported(other.to_string())),
    };

    Ok(Selection {
        bridges: if transport == Transport::Custom {
            bridges.bridge_strings
        } else {
            Vec::new()
        },
        transport,
    })
}

/// Queries the Tor Project's circumvention settings API.
#[derive(Debug, Clone)]
pub struct MoatAutoConf {
    client: reqwest::Client,
    url: String,
    country: Option<String>,
}

impl MoatAutoConf {
    pub fn new(url: impl Into<String>, country: Option<String>) -> Result<Self, AutoConfError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            country,
        })
    }
}

#[async_trait]
impl AutoConfigure for MoatAutoConf {
    async fn perform(&self, settings: &dyn SettingsStore) -> Result<(), AutoConfError> {
        let body = SettingsRequest {
            country: self.country.as_deref(),
            transports: &["obfs4", "snowflake"],
        };
        debug!("Requesting circumvention settings from {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.api+json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AutoConfError::Http {
                status: status.as_u16(),
            });
        }

        let selection = select(response.json().await?)?;
        info!("Auto-configuration selected {}", selection.transport);
        if selection.transport == Transport::Custom {
            settings.set_custom_bridges(selection.bridges);
        }
        settings.set_transport(selection.transport);
        Ok(())
    }
}

//! Resolved application settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::autoconf::DEFAULT_SETTINGS_URL;
use crate::client::Directories;

/// Application settings with every path made absolute.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tor_binary: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs4_binary: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snowflake_binary: Option<PathBuf>,
    pub smart_connect: bool,
    /// Seconds between IP route probes, 0 when disabled.
    pub ip_probe_interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sibling_url: Option<String>,
    #[serde(skip_serializing)]
    pub sibling_token: Option<String>,
    pub auto_conf_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        // Falls back gracefully: data dir -> home dir -> current dir
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("onionlink"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".onionlink")))
            .unwrap_or_else(|| PathBuf::from(".onionlink"));
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            tor_binary: None,
            obfs4_binary: None,
            snowflake_binary: None,
            smart_connect: true,
            ip_probe_interval: 5,
            sibling_url: None,
            sibling_token: None,
            auto_conf_url: DEFAULT_SETTINGS_URL.to_string(),
            country: None,
        }
    }

    /// Persisted transport selection and custom bridges.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// State directory for pluggable transport helpers.
    pub fn pt_state_dir(&self) -> PathBuf {
        self.data_dir.join("pt_state")
    }

    pub fn directories(&self) -> Directories {
        Directories::under(&self.data_dir)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.ip_probe_interval > 0).then(|| Duration::from_secs(self.ip_probe_interval))
    }
}

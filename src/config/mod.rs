//! Configuration management using the prefer crate.

mod loader;
mod settings;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use loader::{load_settings_with_options, LoadOptions};
pub use settings::Settings;

/// Sibling Tor application discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, prefer::FromValue)]
pub struct SiblingConfig {
    /// Base URL of the sibling's local status API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bearer token for the status API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SiblingConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Circumvention settings service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, prefer::FromValue)]
pub struct AutoConfConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Two-letter country code sent with the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl AutoConfConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Path to the tor binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tor_binary: Option<String>,
    /// Path to the obfs4 client (lyrebird or obfs4proxy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs4_binary: Option<String>,
    /// Path to snowflake-client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snowflake_binary: Option<String>,
    /// Walk the transport cascade when bootstrap stalls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_connect: Option<bool>,
    /// Seconds between IP route probes. 0 disables probing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_probe_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "SiblingConfig::is_default")]
    #[prefer(default)]
    pub sibling: SiblingConfig,
    #[serde(default, skip_serializing_if = "AutoConfConfig::is_default")]
    #[prefer(default)]
    pub auto_conf: AutoConfConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    pub async fn load() -> Self {
        match prefer::load("onionlink").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Self::default()
                }),
                None => Self::default(),
            },
            // No config file found
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// TOML or JSON, chosen by file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        let mut config = Self::parse(path, &contents)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, String> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        match ext {
            "json" => serde_json::from_str(contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e)),
            _ => toml::from_str(contents).map_err(|e| format!("Failed to parse TOML config: {}", e)),
        }
    }

    /// Directory containing the config file, if loaded from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// `~` is expanded, absolute paths are returned as-is.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
        }
        if let Some(ref tor) = self.tor_binary {
            settings.tor_binary = Some(self.resolve_path(tor, base_dir));
        }
        if let Some(ref obfs4) = self.obfs4_binary {
            settings.obfs4_binary = Some(self.resolve_path(obfs4, base_dir));
        }
        if let Some(ref snowflake) = self.snowflake_binary {
            settings.snowflake_binary = Some(self.resolve_path(snowflake, base_dir));
        }
        if let Some(smart) = self.smart_connect {
            settings.smart_connect = smart;
        }
        if let Some(interval) = self.ip_probe_interval {
            settings.ip_probe_interval = interval;
        }
        if let Some(ref url) = self.sibling.url {
            settings.sibling_url = Some(url.clone());
        }
        if let Some(ref token) = self.sibling.token {
            settings.sibling_token = Some(token.clone());
        }
        if let Some(ref url) = self.auto_conf.url {
            settings.auto_conf_url = url.clone();
        }
        if let Some(ref country) = self.auto_conf.country {
            settings.country = Some(country.to_lowercase());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config() {
        let config = Config::parse(
            Path::new("onionlink.toml"),
            r#"
data_dir = "state"
smart_connect = false

[sibling]
url = "http://127.0.0.1:8118"

[auto_conf]
country = "IR"
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir.as_deref(), Some("state"));
        assert_eq!(config.sibling.url.as_deref(), Some("http://127.0.0.1:8118"));

        let mut settings = Settings::with_data_dir(PathBuf::from("/unused"));
        config.apply_to_settings(&mut settings, Path::new("/etc/onionlink"));
        assert_eq!(settings.data_dir, PathBuf::from("/etc/onionlink/state"));
        assert!(!settings.smart_connect);
        assert_eq!(settings.country.as_deref(), Some("ir"));
    }

    #[test]
    fn parse_json_config() {
        let config = Config::parse(
            Path::new("onionlink.json"),
            r#"{"tor_binary": "/opt/tor/bin/tor", "ip_probe_interval": 0}"#,
        )
        .unwrap();
        let mut settings = Settings::with_data_dir(PathBuf::from("/data"));
        config.apply_to_settings(&mut settings, Path::new("/"));

        assert_eq!(settings.tor_binary, Some(PathBuf::from("/opt/tor/bin/tor")));
        assert_eq!(settings.ip_probe_interval, 0);
    }

    #[test]
    fn invalid_config_is_an_error() {
        assert!(Config::parse(Path::new("bad.toml"), "data_dir = [").is_err());
    }

    #[test]
    fn resolve_absolute_path_unchanged() {
        let config = Config::default();
        assert_eq!(
            config.resolve_path("/var/lib/onionlink", Path::new("/etc")),
            PathBuf::from("/var/lib/onionlink")
        );
    }

    #[tokio::test]
    async fn load_from_path_records_source() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("onionlink.toml");
        tokio::fs::write(&path, "smart_connect = true\n").await.unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.base_dir(), Some(tmp.path().to_path_buf()));
    }
}

//! Configuration loading and environment overrides.

use std::path::{Path, PathBuf};

use super::{Config, Settings};

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory (--data-dir flag).
    pub data_dir: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

fn expand(path: &str) -> PathBuf {
    absolute(Path::new(shellexpand::tilde(path).as_ref()))
}

async fn load_file_config(options: &LoadOptions) -> Config {
    // Priority 1: Explicit --config flag
    if let Some(ref config_path) = options.config_path {
        return match Config::load_from_path(config_path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}", e);
                Config::default()
            }
        };
    }
    // Priority 2: Auto-discover via prefer
    Config::load().await
}

/// Apply `ONIONLINK_*` environment variables.
pub(crate) fn apply_env_overrides(settings: &mut Settings) {
    if let Some(dir) = env_var("ONIONLINK_DATA_DIR") {
        tracing::debug!("Using ONIONLINK_DATA_DIR from environment: {}", dir);
        settings.data_dir = expand(&dir);
    }
    if let Some(tor) = env_var("ONIONLINK_TOR_BINARY") {
        settings.tor_binary = Some(expand(&tor));
    }
    if let Some(url) = env_var("ONIONLINK_SIBLING_URL") {
        settings.sibling_url = Some(url);
    }
    if let Some(token) = env_var("ONIONLINK_SIBLING_TOKEN") {
        settings.sibling_token = Some(token);
    }
    if let Some(country) = env_var("ONIONLINK_COUNTRY") {
        settings.country = Some(country.to_lowercase());
    }
}

/// Load settings with explicit options.
///
/// Precedence, highest first: command line, environment, config file,
/// defaults.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let config = load_file_config(&options).await;
    let mut settings = Settings::default();

    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings);

    if let Some(ref data_dir) = options.data_dir {
        settings.data_dir = absolute(data_dir);
    }

    (settings, config)
}

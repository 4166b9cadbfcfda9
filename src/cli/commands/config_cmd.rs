//! Configuration display.

use console::style;

use onionlink::config::{Config, Settings};

use crate::cli::icons::dim_arrow;

/// Print the effective settings as TOML.
pub fn cmd_config_show(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    match config.source_path {
        Some(ref path) => eprintln!("{} Loaded from {}", dim_arrow(), path.display()),
        None => eprintln!("{} No config file found, using defaults", dim_arrow()),
    }
    if settings.sibling_token.is_some() {
        eprintln!("{} Sibling token is set {}", dim_arrow(), style("(hidden)").dim());
    }
    print!("{}", toml::to_string_pretty(settings)?);
    Ok(())
}

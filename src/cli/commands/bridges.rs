//! Custom bridge lines.

use console::style;

use onionlink::config::Settings;
use onionlink::store::FileSettingsStore;
use onionlink::SettingsStore;

use crate::cli::icons::{bullet, success, warn};

/// Normalize a user-supplied bridge line. Lines pasted from the bridge
/// distribution page may carry a leading `Bridge ` keyword.
fn normalize_line(line: &str) -> Option<String> {
    let line = line.trim();
    let line = line.strip_prefix("Bridge ").unwrap_or(line).trim();
    let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
    (!normalized.is_empty()).then_some(normalized)
}

pub fn cmd_bridges_list(settings: &Settings) -> anyhow::Result<()> {
    let store = FileSettingsStore::open(settings.state_file());
    let bridges = store.custom_bridges();
    if bridges.is_empty() {
        println!("No custom bridges stored.");
        return Ok(());
    }
    println!("{}", style(format!("{} custom bridge(s):", bridges.len())).bold());
    for line in bridges {
        println!("  {} {}", bullet(), line);
    }
    Ok(())
}

pub fn cmd_bridges_add(settings: &Settings, line: &str) -> anyhow::Result<()> {
    let Some(line) = normalize_line(line) else {
        anyhow::bail!("Bridge line is empty");
    };
    if !line.starts_with("obfs4 ") {
        eprintln!(
            "{} Custom bridges are used with the obfs4 transport; this line is not obfs4",
            warn()
        );
    }

    let store = FileSettingsStore::open(settings.state_file());
    let mut bridges = store.custom_bridges();
    if bridges.contains(&line) {
        println!("{} Bridge already stored", success());
        return Ok(());
    }
    bridges.push(line);
    let count = bridges.len();
    store.set_custom_bridges(bridges);
    println!("{} Stored bridge ({} total)", success(), count);
    Ok(())
}

pub fn cmd_bridges_clear(settings: &Settings) -> anyhow::Result<()> {
    let store = FileSettingsStore::open(settings.state_file());
    store.set_custom_bridges(Vec::new());
    println!("{} Cleared custom bridges", success());
    Ok(())
}

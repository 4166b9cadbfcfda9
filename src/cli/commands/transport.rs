//! Stored transport selection.

use console::style;

use onionlink::config::Settings;
use onionlink::store::FileSettingsStore;
use onionlink::{SettingsStore, Transport};

use crate::cli::icons::{dim_arrow, success, warn};

pub fn cmd_transport_show(settings: &Settings) -> anyhow::Result<()> {
    let store = FileSettingsStore::open(settings.state_file());
    let transport = store.transport();
    println!("{} {}", style("Transport:").bold(), style(transport).cyan());
    if transport == Transport::Custom {
        println!(
            "  {} {} custom bridge line(s)",
            dim_arrow(),
            store.custom_bridges().len()
        );
    }
    Ok(())
}

pub fn cmd_transport_set(settings: &Settings, transport: Transport) -> anyhow::Result<()> {
    let store = FileSettingsStore::open(settings.state_file());
    if transport == Transport::Custom && store.custom_bridges().is_empty() {
        eprintln!(
            "{} No custom bridges stored yet. Add some with `onionlink bridges add`.",
            warn()
        );
    }
    store.set_transport(transport);
    println!("{} Transport set to {}", success(), style(transport).cyan());
    println!("  {} Saved to {}", dim_arrow(), store.path().display());
    Ok(())
}

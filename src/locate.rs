//! Executable discovery for tor and pluggable transport binaries.

use std::path::{Path, PathBuf};

/// Find a binary, preferring an explicitly configured path.
///
/// Falls back to searching `PATH` (and absolute fallbacks) for each candidate
/// in order.
pub fn find_binary(explicit: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!("Configured binary {} does not exist", path.display());
    }

    candidates
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
}

/// Standard names for the tor binary.
pub fn tor_candidates() -> &'static [&'static str] {
    if cfg!(windows) {
        &["tor.exe", "Tor\\tor.exe"]
    } else {
        &["tor", "/usr/bin/tor", "/usr/local/bin/tor", "/opt/homebrew/bin/tor"]
    }
}

/// Standard names for the obfs4 client.
pub fn obfs4_candidates() -> &'static [&'static str] {
    &["lyrebird", "obfs4proxy", "/usr/bin/lyrebird", "/usr/bin/obfs4proxy"]
}

/// Standard names for the snowflake client.
pub fn snowflake_candidates() -> &'static [&'static str] {
    &["snowflake-client", "/usr/bin/snowflake-client"]
}

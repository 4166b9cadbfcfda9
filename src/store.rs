//! Persisted transport selection and custom bridges.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::transport::Transport;

/// Narrow read/write access to the persisted connection settings.
pub trait SettingsStore: Send + Sync {
    fn transport(&self) -> Transport;
    fn set_transport(&self, transport: Transport);
    fn custom_bridges(&self) -> Vec<String>;
    fn set_custom_bridges(&self, bridges: Vec<String>);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_bridges: Vec<String>,
}

/// Settings kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<StoredSettings>,
}

impl MemorySettingsStore {
    pub fn new(transport: Transport, custom_bridges: Vec<String>) -> Self {
        Self {
            inner: Mutex::new(StoredSettings {
                transport,
                custom_bridges,
            }),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn transport(&self) -> Transport {
        lock(&self.inner).transport
    }

    fn set_transport(&self, transport: Transport) {
        lock(&self.inner).transport = transport;
    }

    fn custom_bridges(&self) -> Vec<String> {
        lock(&self.inner).custom_bridges.clone()
    }

    fn set_custom_bridges(&self, bridges: Vec<String>) {
        lock(&self.inner).custom_bridges = bridges;
    }
}

/// Settings persisted as JSON, rewritten on every change.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    inner: Mutex<StoredSettings>,
}

impl FileSettingsStore {
    /// Load from `path`. A missing or unreadable file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings {}: {}", path.display(), e);
                StoredSettings::default()
            }),
            Err(_) => StoredSettings::default(),
        };
        Self {
            path,
            inner: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, settings: &StoredSettings) {
        let result = serde_json::to_string_pretty(settings)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, json)
            });
        if let Err(e) = result {
            tracing::warn!("Failed to persist settings to {}: {}", self.path.display(), e);
        }
    }

    fn update(&self, f: impl FnOnce(&mut StoredSettings)) {
        let mut guard = lock(&self.inner);
        f(&mut guard);
        self.persist(&guard);
    }
}

impl SettingsStore for FileSettingsStore {
    fn transport(&self) -> Transport {
        lock(&self.inner).transport
    }

    fn set_transport(&self, transport: Transport) {
        self.update(|s| s.transport = transport);
    }

    fn custom_bridges(&self) -> Vec<String> {
        lock(&self.inner).custom_bridges.clone()
    }

    fn set_custom_bridges(&self, bridges: Vec<String>) {
        self.update(|s| s.custom_bridges = bridges);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

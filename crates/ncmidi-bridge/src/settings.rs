/// Persisted user settings.
///
/// The plugin host normally owns persistence; the bridge only needs a string
/// (peer address) and a boolean (logging switch). `TomlSettings` is the
/// file-backed store used by the standalone host, `MemorySettings` serves
/// tests and hosts that persist state elsewhere.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

/// Settings key of the peer IP address
pub const KEY_PEER_IP: &str = "peer_ip";
/// Settings key of the logging switch
pub const KEY_LOGGING_ENABLED: &str = "logging_enabled";

pub trait SettingsStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str);
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool);
    /// Flush pending changes to the backing store.
    fn save(&self) -> anyhow::Result<()>;
}

fn lock(table: &Mutex<toml::Table>) -> MutexGuard<'_, toml::Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// TOML file-backed settings.
pub struct TomlSettings {
    path: PathBuf,
    table: Mutex<toml::Table>,
}

impl TomlSettings {
    /// Open the settings file, starting empty when it doesn't exist yet.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            contents.parse::<toml::Table>()?
        } else {
            debug!(path = %path.display(), "Settings file not found, starting empty");
            toml::Table::new()
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        lock(&self.table)
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set_string(&self, key: &str, value: &str) {
        lock(&self.table).insert(key.to_string(), toml::Value::String(value.to_string()));
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        lock(&self.table).get(key).and_then(|v| v.as_bool())
    }

    fn set_bool(&self, key: &str, value: bool) {
        lock(&self.table).insert(key.to_string(), toml::Value::Boolean(value));
    }

    /// Creates parent directories if needed. Overwrites any existing file.
    fn save(&self) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&*lock(&self.table))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, contents)?;
        info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

/// In-memory settings, never persisted.
#[derive(Default)]
pub struct MemorySettings {
    table: Mutex<toml::Table>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_string(&self, key: &str) -> Option<String> {
        lock(&self.table)
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set_string(&self, key: &str, value: &str) {
        lock(&self.table).insert(key.to_string(), toml::Value::String(value.to_string()));
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        lock(&self.table).get(key).and_then(|v| v.as_bool())
    }

    fn set_bool(&self, key: &str, value: bool) {
        lock(&self.table).insert(key.to_string(), toml::Value::Boolean(value));
    }

    fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

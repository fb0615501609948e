use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const APP_DIR: &str = "ferrex-sync";
const CONFIG_FILE: &str = "config.json";
const SERVER_URL_ENV: &str = "FERREX_SERVER_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    /// Root of the durable store. `None` keeps everything in memory.
    pub cache_dir: Option<PathBuf>,
    pub dispatcher: DispatcherConfig,
    pub snapshots: SnapshotConfig,
    pub realtime: RealtimeConfig,
}

/// Concurrency caps for the request dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Global ceiling of tasks running at once.
    pub max_in_flight: usize,
    /// Default per-server cap.
    pub per_server_in_flight: usize,
    /// Per-server caps overriding the default, by server key.
    pub server_overrides: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub resume_limit: usize,
    pub next_up_limit: usize,
    /// Items per library in the home screen "latest" rows.
    pub latest_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Consecutive transport failures tolerated before giving up.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Number of recent event ids remembered for de-duplication.
    pub dedupe_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "https://localhost:3000".to_string(),
            cache_dir: dirs::cache_dir().map(|dir| dir.join(APP_DIR)),
            dispatcher: DispatcherConfig::default(),
            snapshots: SnapshotConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 6,
            per_server_in_flight: 2,
            server_overrides: HashMap::new(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            resume_limit: 12,
            next_up_limit: 12,
            latest_limit: 16,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            dedupe_window: 256,
        }
    }
}

impl RealtimeConfig {
    /// Delay before reconnect attempt `attempt` (1-based): base doubling,
    /// capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

impl SyncConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Defaults, then the config file, then the `FERREX_SERVER_URL` override.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default().with_env_override(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = Self::default();

        if path.exists() {
            match std::fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<SyncConfig>(&content).map_err(|e| e.to_string())
                }) {
                Ok(loaded) => config = loaded,
                Err(e) => log::warn!(
                    "[Config] Ignoring unreadable config at {}: {}",
                    path.display(),
                    e
                ),
            }
        }

        config.with_env_override()
    }

    fn with_env_override(mut self) -> Self {
        if let Ok(server_url) = std::env::var(SERVER_URL_ENV) {
            self.server_url = server_url;
        }
        self
    }

    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(path) = Self::default_path() {
            self.save_to(&path)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.server_url.trim().is_empty() {
            return Err(SyncError::Validation("server_url is empty".to_string()));
        }
        url::Url::parse(&self.server_url).map_err(|e| {
            SyncError::Validation(format!("server_url '{}' is invalid: {}", self.server_url, e))
        })?;
        if self.dispatcher.max_in_flight == 0 || self.dispatcher.per_server_in_flight == 0 {
            return Err(SyncError::Validation(
                "dispatcher concurrency caps must be at least 1".to_string(),
            ));
        }
        if let Some((key, _)) = self
            .dispatcher
            .server_overrides
            .iter()
            .find(|(_, cap)| **cap == 0)
        {
            return Err(SyncError::Validation(format!(
                "dispatcher cap override for '{key}' must be at least 1"
            )));
        }
        Ok(())
    }
}

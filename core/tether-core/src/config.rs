//! Engine configuration loading and saving.
//!
//! `~/.tether/config.json` is optional. Missing or malformed files fall back
//! to defaults; `TETHER_ENDPOINT` and `TETHER_AUTH_TOKEN` override the file.

use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::StorageConfig;

const ENDPOINT_ENV: &str = "TETHER_ENDPOINT";
const AUTH_TOKEN_ENV: &str = "TETHER_AUTH_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WebSocket endpoint, e.g. `ws://192.168.1.20:3001/ws`.
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub subscribe_retry_delay_ms: u64,
    /// Caller-level timeout for chat sends.
    pub chat_timeout_ms: u64,
    pub backoff: BackoffPolicy,
    pub heartbeat: HeartbeatConfig,
    pub lifecycle: LifecycleConfig,
    pub background_fetch: BackgroundFetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 10_000,
            subscribe_retry_delay_ms: 2_000,
            chat_timeout_ms: 30_000,
            backoff: BackoffPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            lifecycle: LifecycleConfig::default(),
            background_fetch: BackgroundFetchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_retry_delay_ms)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_millis(self.chat_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff.base < 1 {
            return Err(SyncError::Config("backoff.base must be at least 1".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(SyncError::Config(
                "heartbeat.interval_ms must be positive".into(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            let url = url::Url::parse(endpoint)
                .map_err(|err| SyncError::Config(format!("invalid endpoint {endpoint}: {err}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::Config(format!(
                    "endpoint must use ws:// or wss://, got {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// Reconnect delay is `min(base^attempt * unit, cap)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base: u32,
    pub unit_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 2,
            unit_ms: 1_000,
            cap_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.base).checked_pow(attempt).unwrap_or(u64::MAX);
        let millis = factor.saturating_mul(self.unit_ms).min(self.cap_ms);
        Duration::from_millis(millis)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub max_missed_pongs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_missed_pongs: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long the app must stay backgrounded before it counts.
    pub grace_period_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 4_000,
        }
    }
}

impl LifecycleConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundFetchConfig {
    pub connect_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for BackgroundFetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            fetch_timeout_ms: 15_000,
        }
    }
}

impl BackgroundFetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Loads the engine configuration, returning defaults if the file doesn't
/// exist or can't be parsed. Environment overrides are applied last.
pub fn load_engine_config(storage: &StorageConfig) -> EngineConfig {
    let path = storage.config_file();
    let mut config = match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    path = %path.display(),
                    "Malformed config file, using defaults"
                );
                EngineConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to read config file, using defaults");
            EngineConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    config
}

fn apply_env_overrides(config: &mut EngineConfig) {
    if let Some(endpoint) = non_empty_env(ENDPOINT_ENV) {
        config.endpoint = Some(endpoint);
    }
    if let Some(token) = non_empty_env(AUTH_TOKEN_ENV) {
        config.auth_token = Some(token);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Saves the engine configuration. The auth token is never written to disk.
pub fn save_engine_config(storage: &StorageConfig, config: &EngineConfig) -> Result<()> {
    let path = storage.config_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| SyncError::io("create config dir", err))?;
    }
    let sanitized = EngineConfig {
        auth_token: None,
        ..config.clone()
    };
    let content = serde_json::to_string_pretty(&sanitized)
        .map_err(|err| SyncError::json("serialize config", err))?;
    fs::write(&path, content).map_err(|err| SyncError::io("write config", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backoff_schedule_is_deterministic_and_capped() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(policy.delay_for(200), policy.cap());
    }

    #[test]
    fn test_missing_config_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let config = load_engine_config(&storage);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.lifecycle.grace_period_ms, 4_000);
    }

    #[test]
    fn test_malformed_config_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        std::fs::write(storage.config_file(), "{ not json").unwrap();
        let config = load_engine_config(&storage);
        assert_eq!(config.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        std::fs::write(
            storage.config_file(),
            r#"{"endpoint": "ws://localhost:3001/ws", "heartbeat": {"interval_ms": 5000}}"#,
        )
        .unwrap();
        let config = load_engine_config(&storage);
        assert_eq!(config.heartbeat.interval_ms, 5_000);
        assert_eq!(config.heartbeat.max_missed_pongs, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_omits_auth_token() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let config = EngineConfig {
            auth_token: Some("secret".into()),
            ..EngineConfig::default()
        };
        save_engine_config(&storage, &config).unwrap();
        let written = std::fs::read_to_string(storage.config_file()).unwrap();
        assert!(!written.contains("secret"));
    }

    #[test]
    fn test_validate_rejects_http_endpoint() {
        let config = EngineConfig {
            endpoint: Some("http://localhost:3001".into()),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}

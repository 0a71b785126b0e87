// Cziczere Sync Engine: Configuration
//
// `SyncConfig` is read from TOML (default path
// `<config_dir>/cziczere/sync.toml`), then environment overrides are applied,
// then the result is validated. Every field has a default from
// atoms/constants.rs, so an empty or missing file is a valid config.
//
// Env overrides:
//   CZICZERE_WS_URL, CZICZERE_API_BASE, CZICZERE_FEED_URL,
//   CZICZERE_HEARTBEAT_MS, CZICZERE_MAX_RECONNECTS

use crate::atoms::constants::*;
use crate::atoms::error::{SyncError, SyncResult};
use crate::engine::connection::ConnectionSettings;
use crate::engine::store::StoreLimits;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ws_url: String,
    pub api_base: String,
    pub feed_url: String,
    /// Max documents requested per feed subscription; unbounded when absent.
    pub feed_limit: Option<usize>,

    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,

    pub message_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub optimistic_grace_ms: u64,

    pub max_memories: usize,
    pub insight_ring_size: usize,
    pub max_conversation_history: usize,

    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            feed_limit: Some(MAX_MEMORIES),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            message_timeout_ms: MESSAGE_TIMEOUT_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            optimistic_grace_ms: OPTIMISTIC_GRACE_MS,
            max_memories: MAX_MEMORIES,
            insight_ring_size: INSIGHT_RING_SIZE,
            max_conversation_history: MAX_CONVERSATION_HISTORY,
            requests_per_minute: MAX_REQUESTS_PER_MINUTE,
            requests_per_hour: MAX_REQUESTS_PER_HOUR,
        }
    }
}

/// `<config_dir>/cziczere/sync.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cziczere").join("sync.toml"))
}

impl SyncConfig {
    /// Parse a TOML document. No env overrides, no validation.
    pub fn parse(content: &str) -> SyncResult<Self> {
        toml::from_str::<SyncConfig>(content).map_err(|e| SyncError::Config(format!("TOML parse error: {e}")))
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                debug!("[config] Read {}", path.display());
                Self::parse(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[config] {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// File (explicit path or the default one), then process env, then validation.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut config = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!("[config] ws={} api={} feed={}", config.ws_url, config.api_base, config.feed_url);
        Ok(config)
    }

    /// Apply `CZICZERE_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> SyncResult<()> {
        if let Some(v) = lookup("CZICZERE_WS_URL") {
            self.ws_url = v;
        }
        if let Some(v) = lookup("CZICZERE_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = lookup("CZICZERE_FEED_URL") {
            self.feed_url = v;
        }
        if let Some(v) = lookup("CZICZERE_HEARTBEAT_MS") {
            self.heartbeat_interval_ms = parse_number("CZICZERE_HEARTBEAT_MS", &v)?;
        }
        if let Some(v) = lookup("CZICZERE_MAX_RECONNECTS") {
            self.max_reconnect_attempts = parse_number("CZICZERE_MAX_RECONNECTS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        check_scheme("ws_url", &self.ws_url, &["ws", "wss"])?;
        check_scheme("api_base", &self.api_base, &["http", "https"])?;
        check_scheme("feed_url", &self.feed_url, &["http", "https"])?;

        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("message_timeout_ms", self.message_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("optimistic_grace_ms", self.optimistic_grace_ms),
            ("max_reconnect_attempts", self.max_reconnect_attempts as u64),
            ("max_memories", self.max_memories as u64),
            ("insight_ring_size", self.insight_ring_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            url: self.ws_url.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_memories: self.max_memories,
            insight_ring: self.insight_ring_size,
            max_history: self.max_conversation_history,
        }
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn optimistic_grace(&self) -> Duration {
        Duration::from_millis(self.optimistic_grace_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SyncResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("{key}: expected a number, got '{value}'")))
}

fn check_scheme(name: &str, value: &str, allowed: &[&str]) -> SyncResult<()> {
    let url = url::Url::parse(value).map_err(|e| SyncError::Config(format!("{name}: {e}")))?;
    if !allowed.contains(&url.scheme()) {
        return Err(SyncError::Config(format!(
            "{name}: scheme '{}' not allowed (expected {})",
            url.scheme(),
            allowed.join(" or ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_is_defaults() {
        let cfg = SyncConfig::parse("").unwrap();
        assert_eq!(cfg, SyncConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let cfg = SyncConfig::parse("ws_url = \"wss://chat.example/ws\"\nmax_memories = 20\n").unwrap();
        assert_eq!(cfg.ws_url, "wss://chat.example/ws");
        assert_eq!(cfg.max_memories, 20);
        assert_eq!(cfg.heartbeat_interval_ms, HEARTBEAT_INTERVAL_MS);
        assert_eq!(cfg.store_limits().max_memories, 20);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> =
            [("CZICZERE_HEARTBEAT_MS", "1000"), ("CZICZERE_MAX_RECONNECTS", "2"), ("CZICZERE_WS_URL", "wss://x/ws")]
                .into_iter()
                .collect();
        let mut cfg = SyncConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        let conn = cfg.connection_settings();
        assert_eq!(conn.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(conn.max_reconnect_attempts, 2);
        assert_eq!(conn.url, "wss://x/ws");
    }

    #[test]
    fn bad_override_is_config_error() {
        let mut cfg = SyncConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "CZICZERE_HEARTBEAT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn validation_rejects_wrong_scheme_and_zero() {
        let mut cfg = SyncConfig { ws_url: "http://chat/ws".into(), ..Default::default() };
        assert!(cfg.validate().is_err());
        cfg.ws_url = DEFAULT_WS_URL.into();
        cfg.heartbeat_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_is_defaults() {
        let path = std::env::temp_dir().join(format!("cziczere-missing-{}.toml", uuid::Uuid::new_v4()));
        assert_eq!(SyncConfig::from_file(&path).unwrap(), SyncConfig::default());
    }
}

//! Configuration management for confab services.
//!
//! All confab components share a unified configuration file at `~/.confab/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (CONFAB_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `CONFAB_TRANSPORT` → transport.backend
//! - `CONFAB_REDIS_URL` → transport.redis_url
//! - `CONFAB_CLIENT_ID` → transport.client_id
//! - `CONFAB_MAX_SESSIONS` → session.max_sessions
//! - `CONFAB_TIMEOUT_MS` → call.timeout_ms
//! - `CONFAB_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".confab"),
        |dirs| dirs.home_dir().join(".confab"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Pub/sub transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Backend selector: "memory" (in-process) or "redis".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Redis connection URL, used when backend is "redis".
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Topic the far-end worker listens on for chat requests.
    #[serde(default = "default_request_topic")]
    pub request_topic: String,

    /// Base prefix for reply topics; the full reply topic is
    /// `{reply_prefix}/{session_id}/{client_id}/{request_id}`.
    #[serde(default = "default_reply_prefix")]
    pub reply_prefix: String,

    /// Identifier for this client instance, embedded in reply topics so
    /// replies can be routed back to the publishing process.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Upper bound in seconds for the reconnect backoff delay.
    #[serde(default = "default_reconnect_ceiling_secs")]
    pub reconnect_ceiling_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            request_topic: default_request_topic(),
            reply_prefix: default_reply_prefix(),
            client_id: default_client_id(),
            reconnect_ceiling_secs: default_reconnect_ceiling_secs(),
        }
    }
}

fn default_backend() -> String {
    "memory".into()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_request_topic() -> String {
    "confab/ask".into()
}

fn default_reply_prefix() -> String {
    "confab/reply".into()
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("confab-{}", &id[..8])
}

fn default_reconnect_ceiling_secs() -> u64 {
    30
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Session store and history trimming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard ceiling on resident sessions; exceeding it evicts the
    /// least-recently-used session.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Number of recent user/assistant pairs kept by the message budget.
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,

    /// Token budget for the dialog; takes precedence over the pair budget
    /// when set.
    #[serde(default)]
    pub max_tokens: Option<usize>,

    /// Safety margin subtracted from the token budget.
    #[serde(default = "default_token_margin")]
    pub token_margin: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_pairs: default_max_pairs(),
            max_tokens: None,
            token_margin: default_token_margin(),
        }
    }
}

fn default_max_sessions() -> usize {
    32
}

fn default_max_pairs() -> usize {
    10
}

fn default_token_margin() -> usize {
    5
}

// ============================================================================
// Context Memory Configuration
// ============================================================================

/// Context memory (layered prompt assembly) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Capacity of the per-session event ring buffer.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Number of recent moves inspected for trend and oscillation.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    /// Upper bound on remembered obstacle coordinates.
    #[serde(default = "default_max_obstacles")]
    pub max_obstacles: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            recent_window: default_recent_window(),
            max_obstacles: default_max_obstacles(),
        }
    }
}

fn default_ring_capacity() -> usize {
    16
}

fn default_recent_window() -> usize {
    8
}

fn default_max_obstacles() -> usize {
    12
}

// ============================================================================
// Call Configuration
// ============================================================================

/// Per-request call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Reply deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Sampling temperature forwarded to the far end when set.
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Nucleus sampling parameter forwarded to the far end when set.
    #[serde(default)]
    pub top_p: Option<f64>,

    /// Token generation cap forwarded to the far end when set.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for confab.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Pub/sub transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session store and trimming settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Context memory settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Per-call settings
    #[serde(default)]
    pub call: CallConfig,

    /// Observability settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("CONFAB_TRANSPORT") {
            self.transport.backend = backend;
        }
        if let Ok(url) = std::env::var("CONFAB_REDIS_URL") {
            self.transport.redis_url = url;
        }
        if let Ok(id) = std::env::var("CONFAB_CLIENT_ID") {
            self.transport.client_id = id;
        }
        if let Ok(max) = std::env::var("CONFAB_MAX_SESSIONS") {
            if let Ok(n) = max.parse() {
                self.session.max_sessions = n;
            }
        }
        if let Ok(timeout) = std::env::var("CONFAB_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.call.timeout_ms = ms;
            }
        }
        if let Ok(level) = std::env::var("CONFAB_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        let dir = config_dir();

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.session.max_sessions == 0 {
            anyhow::bail!("session.max_sessions must be at least 1");
        }
        if self.call.timeout_ms == 0 {
            anyhow::bail!("call.timeout_ms must be at least 1");
        }
        if let Some(max_tokens) = self.session.max_tokens {
            if max_tokens <= self.session.token_margin {
                anyhow::bail!("session.max_tokens must exceed session.token_margin");
            }
        }
        match self.transport.backend.as_str() {
            "memory" | "redis" => {}
            other => anyhow::bail!("unknown transport backend: {other}"),
        }
        if self.transport.client_id.is_empty() {
            anyhow::bail!("transport.client_id must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.backend, "memory");
        assert_eq!(config.transport.reply_prefix, "confab/reply");
        assert_eq!(config.session.max_sessions, 32);
        assert_eq!(config.session.max_pairs, 10);
        assert_eq!(config.session.token_margin, 5);
        assert!(config.session.max_tokens.is_none());
        assert_eq!(config.call.timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_id_default_shape() {
        let config = TransportConfig::default();
        assert!(config.client_id.starts_with("confab-"));
        assert_eq!(config.client_id.len(), "confab-".len() + 8);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"transport":{"backend":"redis","client_id":"alpha"},"session":{"max_sessions":4}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.transport.backend, "redis");
        assert_eq!(config.transport.client_id, "alpha");
        assert_eq!(config.session.max_sessions, 4);
        // untouched sections keep their defaults
        assert_eq!(config.session.max_pairs, 10);
        assert_eq!(config.call.timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.max_tokens = Some(3);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.backend = "kafka".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("CONFAB_MAX_SESSIONS", "7");
        std::env::set_var("CONFAB_TIMEOUT_MS", "1500");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.max_sessions, 7);
        assert_eq!(config.call.timeout_ms, 1500);

        std::env::remove_var("CONFAB_MAX_SESSIONS");
        std::env::remove_var("CONFAB_TIMEOUT_MS");
    }
}

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub webrtc: WebRTCConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Realtime store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process tree, lost on exit (tests, single-process demos)
    Memory,
    /// Shared tree kept in Redis, changes announced over Pub/Sub
    Redis,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Root segment prepended to every path (empty = none)
    pub namespace: String,
    pub operation_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            namespace: String::new(),
            operation_timeout_secs: 5,
        }
    }
}

/// TURN relay credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// ICE servers handed to every peer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    pub stun_servers: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Prefix of generated session ids
    pub session_id_prefix: String,
    /// Accepted premium prices
    pub premium_tiers: Vec<u32>,
    /// Upper bound of ICE candidates one participant may publish per session
    pub max_candidates_per_peer: usize,
    /// Age after which a live entry counts as abandoned (0 = never)
    pub stale_session_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            session_id_prefix: "stream_".to_string(),
            premium_tiers: vec![
                99, 199, 299, 499, 999, 1499, 1999, 2499, 2999, 3599, 3999, 4999, 5999, 6999,
                7999, 8999, 9999,
            ],
            max_candidates_per_peer: 64,
            stale_session_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_STORE__REDIS_URL, LIVECAST_LIVE__MAX_CANDIDATES_PER_PEER, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for misconfigurations, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!("Unknown logging format: {other}")),
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            errors.push("Redis store backend requires store.redis_url".to_string());
        }

        if self.store.namespace.contains('/') {
            errors.push("store.namespace must be a single path segment".to_string());
        }

        if self.webrtc.stun_servers.is_empty() && self.webrtc.turn.is_none() {
            errors.push("At least one STUN or TURN server is required".to_string());
        }

        if let Some(turn) = &self.webrtc.turn {
            if turn.url.is_empty() {
                errors.push("webrtc.turn.url cannot be empty".to_string());
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                errors.push("TURN servers require username and credential".to_string());
            }
        }

        if self.live.session_id_prefix.is_empty() {
            errors.push("live.session_id_prefix cannot be empty".to_string());
        }

        if self.live.premium_tiers.iter().any(|tier| *tier == 0) {
            errors.push("live.premium_tiers must be positive".to_string());
        }

        if self.live.max_candidates_per_peer == 0 {
            errors.push("live.max_candidates_per_peer must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

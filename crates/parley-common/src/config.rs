//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config file > defaults

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call parley_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// `file` is the config file base name (`config` → `config.toml`, `config.yaml`, ...).
/// Should be called once at application startup, before any other code accesses config.
pub fn init(file: &str) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(file)?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without installing it globally.
pub fn load(file: &str) -> Result<AppConfig, config::ConfigError> {
    let defaults = VoiceConfig::default();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.name", "localhost")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8082)?
        .set_default("voice.ring_timeout_secs", defaults.ring_timeout_secs)?
        .set_default("voice.max_roster_size", defaults.max_roster_size as u64)?
        .set_default("voice.heartbeat_timeout_secs", defaults.heartbeat_timeout_secs)?
        // Optional config file
        .add_source(config::File::with_name(file).required(false))
        // Environment variables (PARLEY_SERVER__PORT, PARLEY_AUTH__JWT_SECRET, etc.)
        .add_source(
            config::Environment::with_prefix("PARLEY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public name of this deployment, shown in logs.
    pub name: String,
    pub host: String,
    /// Port of the voice signaling WebSocket and its HTTP side routes.
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256) shared with the identity service.
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    /// How long a call invitation may ring before it ends with `timeout`.
    pub ring_timeout_secs: u64,
    /// Maximum members of one channel roster. Every member holds a peer link
    /// to every other member, so cost grows quadratically with this value.
    pub max_roster_size: usize,
    /// A connection that sends nothing (not even a heartbeat) for this long
    /// is treated as disconnected.
    pub heartbeat_timeout_secs: u64,
    /// STUN/TURN servers handed to clients in `ready`.
    #[serde(default = "IceServerConfig::defaults")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl VoiceConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Peer links a single client may hold in a full-mesh channel.
    pub fn max_peer_links(&self) -> usize {
        self.max_roster_size.saturating_sub(1)
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 60,
            max_roster_size: 12,
            heartbeat_timeout_secs: 45,
            ice_servers: IceServerConfig::defaults(),
        }
    }
}

/// ICE server configuration sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    /// In production, add TURN servers for NAT traversal.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

//! Service configuration
//!
//! Loaded from a TOML file (path in `GATEWAY_CONFIG`, falling back to
//! `gateway.toml` when present) with every field defaulted, so an empty
//! file and no file at all are both valid configurations.

use serde::Deserialize;

use crate::session::DEFAULT_MAX_SESSIONS;
use crate::users::{User, UserError};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    /// Seed users for the in-memory credential store.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Client-facing listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// External signaling gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    #[serde(default = "default_plugin")]
    pub plugin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// 64-char hex SHA-256 of the password.
    pub password_sha256: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    60000
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8088
}

fn default_plugin() -> String {
    "janus.plugin.videoroom".to_string()
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_server_port(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            plugin: default_plugin(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("bad seed user {username}: {source}")]
    BadUser {
        username: String,
        source: UserError,
    },
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Validated user records for the credential store.
    pub fn seed_users(&self) -> Result<Vec<User>, ConfigError> {
        self.users
            .iter()
            .enumerate()
            .map(|(i, u)| {
                User::new(i as i64 + 1, &u.username, &u.password_sha256).map_err(|source| {
                    ConfigError::BadUser {
                        username: u.username.clone(),
                        source,
                    }
                })
            })
            .collect()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

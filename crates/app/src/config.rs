//! Relay configuration
//!
//! Loaded from an optional TOML file, then overridden by environment:
//!
//! ```toml
//! lobby_name = "lobby"
//! log_filter = "roomlink_net=debug,info"
//!
//! [server]
//! bind_addr = "127.0.0.1"
//! port = 7878
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use roomlink_net::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

/// Overrides `server.bind_addr`
pub const BIND_ENV: &str = "ROOMLINK_BIND";
/// Overrides `server.port`
pub const PORT_ENV: &str = "ROOMLINK_PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Shown to clients when they join
    pub lobby_name: String,
    /// Used when RUST_LOG is not set
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            lobby_name: "lobby".to_string(),
            log_filter: None,
        }
    }
}

impl AppConfig {
    /// Load from `path` (defaults when None) and apply process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `ROOMLINK_*` overrides looked up through `lookup`
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(BIND_ENV) {
            self.server.bind_addr = value.parse::<IpAddr>().map_err(|_| ConfigError::InvalidEnv {
                var: BIND_ENV,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(PORT_ENV) {
            self.server.port = value.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                var: PORT_ENV,
                value: value.clone(),
            })?;
        }
        Ok(())
    }
}

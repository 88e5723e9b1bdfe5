//! Runtime configuration
//!
//! Loads configuration from `caprpc.toml` in the working directory (or
//! `CAPRPC_CONFIG` env). Every field has a default, so a missing file is fine.

use std::path::Path;
use std::path::PathBuf;

use caprpc_protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub rpc: EngineConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Stream transport settings
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Largest frame accepted from a peer, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Connection engine settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Log every message sent and received at debug level
    #[serde(default)]
    pub trace_messages: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:4710".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_connect")]
    pub connect: String,
}

fn default_connect() -> String {
    default_listen()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
        }
    }
}

impl RpcConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "CAPRPC_CONFIG";

    pub const DEFAULT_CONFIG_FILENAME: &'static str = "caprpc.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `CAPRPC_CONFIG` environment variable
    /// 2. `./caprpc.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "caprpc config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let cfg: RpcConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }
        PathBuf::from(Self::DEFAULT_CONFIG_FILENAME)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_frame_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

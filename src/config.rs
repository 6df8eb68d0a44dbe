use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from prefork.toml.
///
/// Every section has defaults, so a missing file or a partial file is fine.
/// CLI flags are applied on top via `apply_overrides`.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub respawn: RespawnConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub worker_count: u32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub backlog: u32,
    pub max_request_bytes: usize,
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RespawnConfig {
    pub retry_delay_ms: u64,
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value failed validation.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a present but unreadable or
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply CLI flag overrides on top of file values.
    pub fn apply_overrides(
        &mut self,
        worker_count: Option<u32>,
        host: Option<String>,
        port: Option<u16>,
    ) {
        if let Some(n) = worker_count {
            self.server.worker_count = n;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if let Some(p) = port {
            self.server.port = p;
        }
    }

    /// Validate the merged configuration before anything is bound or spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "server.worker_count must be at least 1".to_string(),
            ));
        }
        if self.limits.backlog == 0 {
            return Err(ConfigError::Invalid(
                "limits.backlog must be at least 1".to_string(),
            ));
        }
        if self.limits.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_request_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            backlog: 512,
            max_request_bytes: 512,
            read_timeout_secs: 5,
        }
    }
}

impl Default for RespawnConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
        }
    }
}

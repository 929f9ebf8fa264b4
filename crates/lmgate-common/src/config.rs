use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// CLI flags. Anything set here wins over the config file and environment.
#[derive(Parser, Debug, Default)]
#[command(name = "lmgate")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, env = "GATEWAY_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "GATEWAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub wait_time: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_time: 0.0,
        }
    }
}

/// One `proxy.<name>` section: describes a ResourcePool of egress proxy URLs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyPoolConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub initial: Vec<String>,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub cooldown_time: u64,
}

fn default_repeat() -> u32 {
    1
}
fn default_timeout() -> u64 {
    30
}
fn default_separator() -> String {
    "\n".to_string()
}

/// One entry in `worker.workers`. `settings` holds the class-specific fields
/// (models_url, completions_url, api_keys, aliases, ...); only `class`,
/// `name` and `priority` are interpreted generically, by the bootstrap
/// registry that turns this into a live Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntryConfig {
    pub class: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub settings: serde_json::Value,
}

/// One entry in `middleware.middlewares`, same shape as `WorkerEntryConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareEntryConfig {
    pub class: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerSection {
    #[serde(default)]
    pub workers: Vec<WorkerEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiddlewareSection {
    #[serde(default)]
    pub middlewares: Vec<MiddlewareEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    pub proxy: HashMap<String, ProxyPoolConfig>,
    pub worker: WorkerSection,
    pub middleware: MiddlewareSection,
}

impl GatewayConfig {
    /// Loads the file at `path` (if given), then overlays environment and
    /// CLI overrides. Missing file is not an error: an absent `--config`
    /// means "defaults plus overrides".
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut cfg = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(host) = &cli.host {
            cfg.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            cfg.server.port = port;
        }
        if let Some(level) = &cli.log_level {
            cfg.logging.level = level.clone();
        }

        Ok(cfg)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

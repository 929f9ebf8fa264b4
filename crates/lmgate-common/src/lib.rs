pub mod config;
pub mod error;

pub use config::{
    Cli, GatewayConfig, LoggingConfig, MiddlewareEntryConfig, ProxyPoolConfig, RetryConfig,
    ServerConfig, WorkerEntryConfig,
};
pub use error::ConfigError;

/// Installs the process-wide `tracing` subscriber from `logging.level`.
/// Call once, from the binary's `main`.
pub fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Reconciles Modules into per-node NodeModulesConfigs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Only watch Modules in this namespace
    #[arg(long, env = "KMM_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Delay before retrying a failed reconcile
    #[arg(long, env = "KMM_ERROR_REQUEUE_SECONDS", default_value_t = 3)]
    pub error_requeue_seconds: u64,

    /// Timeout of a single registry request
    #[arg(long, env = "KMM_REGISTRY_TIMEOUT_SECONDS", default_value_t = 30)]
    pub registry_timeout_seconds: u64,

    #[arg(long, env = "KMM_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_seconds)
    }

    /// `RUST_LOG` wins over the default `info` level.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self.log_format {
            LogFormat::Text => builder.init(),
            LogFormat::Json => builder.json().init(),
        }
    }
}

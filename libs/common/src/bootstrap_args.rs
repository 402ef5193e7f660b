//! Common command-line arguments for invsrv binaries

#[cfg(feature = "cli")]
use clap::Args;

/// Shared startup flags
///
/// Flattened into each binary's own `Parser` so every entry point accepts the
/// same logging and configuration options.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ServiceArgs {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[cfg_attr(
        feature = "cli",
        arg(short = 'l', long, env = "INVSRV_LOG_LEVEL", global = true)
    )]
    pub log_level: Option<String>,

    /// Configuration file (YAML)
    #[cfg_attr(
        feature = "cli",
        arg(short = 'c', long, env = "INVSRV_CONFIG", global = true)
    )]
    pub config: Option<String>,

    /// Disable colored output and the startup banner
    #[cfg_attr(feature = "cli", arg(long, global = true))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", arg(long, global = true))]
    pub validate: bool,
}

impl ServiceArgs {
    /// Command-line level, else `configured`, else info
    pub fn effective_log_level(&self, configured: Option<&str>) -> tracing::Level {
        let level = self.log_level.as_deref().or(configured).unwrap_or("info");
        match level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Configuration path with the service default as fallback
    pub fn config_path(&self, service_name: &str) -> String {
        self.config
            .clone()
            .unwrap_or_else(|| format!("config/{service_name}.yaml"))
    }
}

//! Service bootstrap utilities
//!
//! Startup banner and logging initialization shared by invsrv entry points.

use crate::bootstrap_args::ServiceArgs;
use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "invsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: description.into(),
        }
    }

    /// Report the calling binary's version instead of this library's
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Print startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    info!("");
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Initialize logging for a service
///
/// `log_dir` and `log_level` come from the service configuration;
/// `INVSRV_LOG_DIR` and `--log-level` still take precedence. One-shot commands
/// pass `enable_file = false` so they do not litter the log directory.
pub fn init_logging(
    service: &ServiceInfo,
    args: &ServiceArgs,
    log_dir: Option<&str>,
    log_level: Option<&str>,
    enable_file: bool,
) -> anyhow::Result<()> {
    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::resolve_log_root(log_dir),
        level: args.effective_log_level(log_level),
        enable_file,
        ansi: !args.no_color,
        ..Default::default()
    };

    logging::init_with_config(log_config)
}

/// Filter to apply after a config reload, if any
///
/// Only a change of the configured level counts. `--log-level` and `RUST_LOG`
/// keep precedence, so with either set the running filter is left alone.
pub fn reload_directive(
    service_name: &str,
    args: &ServiceArgs,
    applied: &str,
    configured: &str,
) -> Option<String> {
    if applied.eq_ignore_ascii_case(configured) || args.log_level.is_some() {
        return None;
    }
    if std::env::var("RUST_LOG").is_ok_and(|v| !v.is_empty()) {
        return None;
    }

    let log_config = LogConfig {
        service_name: service_name.to_string(),
        level: args.effective_log_level(Some(configured)),
        ..Default::default()
    };
    Some(logging::default_directive(&log_config))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_service_info_creation() {
        let service = ServiceInfo::new("invsrv", "Inverter Service");
        assert_eq!(service.name, "invsrv");
        assert_eq!(service.description, "Inverter Service");
        assert!(!service.version.is_empty());
    }

    #[test]
    fn test_reload_keeps_cli_override() {
        let args = ServiceArgs {
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        assert_eq!(reload_directive("invsrv", &args, "info", "info"), None);
        assert_eq!(reload_directive("invsrv", &args, "info", "warn"), None);
    }

    #[test]
    fn test_reload_only_on_config_change() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let args = ServiceArgs::default();
        assert_eq!(reload_directive("invsrv", &args, "info", "INFO"), None);
        assert_eq!(
            reload_directive("invsrv", &args, "info", "warn").as_deref(),
            Some("warn,invsrv=debug")
        );
        assert_eq!(
            reload_directive("invsrv", &args, "info", "trace").as_deref(),
            Some("trace")
        );
    }
}

//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `INVSRV_`-prefixed environment variables (nested keys split on `__`).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocols::modbus::constants::DEFAULT_MODBUS_PORT;

pub const DEFAULT_UNIT_ID: u8 = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
pub const MAX_POLL_INTERVAL_SECS: u64 = 3600;
pub const MAX_UNIT_ID: u8 = 247;

pub const ENV_PREFIX: &str = "INVSRV_";

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Overridden by `INVSRV_LOG_DIR`
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_name() -> String {
    "invsrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_dir: None,
            log_level: default_log_level(),
        }
    }
}

/// One polled inverter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Modbus slave id
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_MODBUS_PORT,
            unit_id: DEFAULT_UNIT_ID,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Identity of the physical endpoint; one coordinator per id
    pub fn unique_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.host.trim().to_ascii_lowercase(),
            self.port,
            self.unit_id
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("devices.{}.{}", self.name, name);

        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("devices.name", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid(field("host"), "must not be empty"));
        }
        if self.host.trim() != self.host {
            return Err(ConfigError::invalid(
                field("host"),
                "must not have leading or trailing whitespace",
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid(field("port"), "must be 1-65535"));
        }
        if !(1..=MAX_UNIT_ID).contains(&self.unit_id) {
            return Err(ConfigError::invalid(
                field("unit_id"),
                format!("{} outside 1-{}", self.unit_id, MAX_UNIT_ID),
            ));
        }
        validate_poll_interval(self.poll_interval_secs)
            .map_err(|reason| ConfigError::invalid(field("poll_interval_secs"), reason))
    }
}

/// Shared range check for configured and runtime interval changes
pub fn validate_poll_interval(secs: u64) -> Result<(), String> {
    if (MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(format!(
            "{secs}s outside {MIN_POLL_INTERVAL_SECS}-{MAX_POLL_INTERVAL_SECS}s"
        ))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvsrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl InvsrvConfig {
    /// Load defaults, then `path`, then environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let mut config: Self = Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        for device in &mut config.devices {
            device.name = device.name.trim().to_string();
            device.host = device.host.trim().to_string();
        }
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(InvsrvConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::invalid("service.name", "must not be empty"));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::invalid(
                "devices",
                "at least one device must be configured",
            ));
        }

        let mut names = HashSet::new();
        let mut endpoints = HashMap::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::invalid(
                    "devices.name",
                    format!("duplicate device name '{}'", device.name),
                ));
            }
            if let Some(first) = endpoints.insert(device.unique_id(), device.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("devices.{}", device.name),
                    format!(
                        "same endpoint {}:{} unit {} as device '{}'",
                        device.host, device.port, device.unit_id, first
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_applies_defaults() {
        let file = write_yaml(
            r#"
devices:
  - name: garage
    host: 192.168.1.50
"#,
        );
        let config = InvsrvConfig::load(file.path()).unwrap();
        assert_eq!(config.service.name, "invsrv");
        let device = config.device("garage").unwrap();
        assert_eq!(device.port, 502);
        assert_eq!(device.unit_id, 3);
        assert_eq!(device.poll_interval(), Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = InvsrvConfig::load("/nonexistent/invsrv.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let mut device = DeviceConfig::new("a", "10.0.0.2");
        device.validate().unwrap();

        device.unit_id = 0;
        assert!(device.validate().is_err());
        device.unit_id = 248;
        assert!(device.validate().is_err());
        device.unit_id = 247;
        device.validate().unwrap();

        device.port = 0;
        assert!(device.validate().is_err());
        device.port = 1502;

        device.poll_interval_secs = 4;
        assert!(device.validate().is_err());
        device.poll_interval_secs = 3601;
        assert!(device.validate().is_err());
        device.poll_interval_secs = 3600;
        device.validate().unwrap();

        device.host = "  ".into();
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("devices.a.host"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = InvsrvConfig {
            service: ServiceConfig::default(),
            devices: vec![
                DeviceConfig::new("roof", "10.0.0.2"),
                DeviceConfig::new("roof", "10.0.0.3"),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate device name"));

        assert!(InvsrvConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_endpoints() {
        let config = InvsrvConfig {
            service: ServiceConfig::default(),
            devices: vec![
                DeviceConfig::new("roof", "10.0.0.2"),
                DeviceConfig::new("garage", "10.0.0.2"),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("as device 'roof'"));

        // Another unit behind the same gateway is a different device
        let mut config = config;
        config.devices[1].unit_id = 4;
        config.validate().unwrap();
    }

    #[test]
    fn test_load_trims_host() {
        let file = write_yaml(
            r#"
devices:
  - name: garage
    host: " 10.0.0.2 "
"#,
        );
        let config = InvsrvConfig::load(file.path()).unwrap();
        assert_eq!(config.device("garage").unwrap().host, "10.0.0.2");
        config.validate().unwrap();

        let padded = DeviceConfig::new("roof", " 10.0.0.2 ");
        let err = padded.validate().unwrap_err();
        assert!(err.to_string().contains("devices.roof.host"));
    }
}

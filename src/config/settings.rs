//! Application settings and device aliases

use super::ConfigError;
use crate::core::device::DeviceSpec;
use crate::core::discovery::DiscoverySettings;
use crate::core::probe::Pid;
use crate::core::transport::{SerialConfig, SerialFlowControl, SerialParity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Line settings used for every port
    pub serial: SerialDefaults,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Named devices
    pub devices: BTreeMap<String, DeviceAlias>,
}

impl AppConfig {
    /// Load config from the default location, or defaults if there is none
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        super::init_directories()?;
        self.save_to(&super::config_path()?)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every device alias
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, alias) in &self.devices {
            alias.pid(name)?;
        }
        Ok(())
    }

    /// Serial line settings as a port template
    pub fn serial_template(&self) -> SerialConfig {
        SerialConfig::new("", self.serial.baud_rate)
            .timeout(Duration::from_millis(self.serial.timeout_ms))
            .data_bits(self.serial.data_bits)
            .stop_bits(self.serial.stop_bits)
            .parity(self.serial.parity)
            .flow_control(self.serial.flow_control)
    }

    /// Settings for a discovery cycle
    pub fn discovery_settings(&self) -> DiscoverySettings {
        let timeout_ms = self
            .discovery
            .probe_timeout_ms
            .unwrap_or(self.serial.timeout_ms);
        DiscoverySettings {
            baud_rate: self.serial.baud_rate,
            timeout: Duration::from_millis(timeout_ms),
            include: self.discovery.include.clone(),
            exclude: self.discovery.exclude.clone(),
        }
    }

    /// Device spec for the alias `name`
    pub fn device(&self, name: &str) -> Result<DeviceSpec, ConfigError> {
        let alias = self
            .devices
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDevice(name.to_string()))?;
        let timeout = Duration::from_millis(alias.timeout_ms.unwrap_or(self.serial.timeout_ms));
        Ok(DeviceSpec::new(name, alias.pid(name)?)
            .baud_rate(alias.baud_rate.unwrap_or(self.serial.baud_rate))
            .timeout(timeout))
    }

    /// Register a named device
    pub fn add_device(&mut self, name: impl Into<String>, pid: &Pid) {
        self.devices.insert(
            name.into(),
            DeviceAlias {
                pid: pid.to_string(),
                ..DeviceAlias::default()
            },
        );
    }
}

/// Serial line defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialDefaults {
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl Default for SerialDefaults {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout_ms: 1000,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Probe timeout in milliseconds; the serial timeout when unset
    pub probe_timeout_ms: Option<u64>,
    /// Only probe ports containing one of these substrings
    pub include: Vec<String>,
    /// Skip ports containing one of these substrings
    pub exclude: Vec<String>,
}

/// A named device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAlias {
    /// PID, decimal (`7`) or hex (`0x07`)
    pub pid: String,
    /// Baud rate override
    pub baud_rate: Option<u32>,
    /// Timeout override in milliseconds
    pub timeout_ms: Option<u64>,
    /// Free-form note
    pub description: Option<String>,
}

impl DeviceAlias {
    fn pid(&self, name: &str) -> Result<Pid, ConfigError> {
        self.pid.parse().map_err(|reason| ConfigError::InvalidAlias {
            name: name.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(config.devices.is_empty());

        let settings = config.discovery_settings();
        assert_eq!(settings.timeout, Duration::from_millis(1000));
        assert!(settings.matches("/dev/ttyUSB0"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.serial.parity = SerialParity::Even;
        config.discovery.exclude.push("ttyS".into());
        config.add_device("drive", &Pid::from(1u8));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[discovery]
probe_timeout_ms = 250

[devices.sensor]
pid = "0x02"
baud_rate = 9600
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.serial, SerialDefaults::default());
        assert_eq!(config.discovery_settings().timeout, Duration::from_millis(250));

        let spec = config.device("sensor").unwrap();
        assert_eq!(spec.pid(), &Pid::from(2u8));
        assert_eq!(spec.baud(), 9600);
        assert_eq!(spec.read_timeout(), Duration::from_millis(SerialDefaults::default().timeout_ms));
        assert!(matches!(config.device("drive"), Err(ConfigError::UnknownDevice(_))));
    }

    #[test]
    fn test_invalid_alias_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[devices.bad]\npid = \"300\"\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::InvalidAlias { .. })
        ));
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[serial\nbaud_rate = ").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_serial_template() {
        let mut config = AppConfig::default();
        config.serial.stop_bits = 2;
        let template = config.serial_template();
        assert_eq!(template.stop_bits, 2);
        assert_eq!(template.timeout_duration(), Duration::from_millis(1000));
    }
}

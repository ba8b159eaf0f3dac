//! Configuration module
//!
//! Handles serial defaults, discovery filters and named device aliases

mod settings;

pub use settings::{AppConfig, DeviceAlias, DiscoveryConfig, SerialDefaults};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No configuration directory on this platform
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// No device alias with this name
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// A device alias names an invalid PID
    #[error("Device alias '{name}': {reason}")]
    InvalidAlias {
        /// Alias name
        name: String,
        /// Parse failure
        reason: String,
    },
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "portbind", "portbind").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Path of the default config file
pub fn config_path() -> Result<PathBuf, ConfigError> {
    config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Initialize the configuration directory
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

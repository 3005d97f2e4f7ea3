//! Configuration management for patchbay
//!
//! This module provides:
//! - The routing configuration consumed by the policy (target device, port names)
//! - Engine tuning knobs (timeouts, polling, debounce)
//! - TOML load/save and a manager for the on-disk config file
//!
//! Configuration is read once at startup. Changing it requires a restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Routing policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Node name of the multi-port sink to route into
    pub target_device_name: String,

    /// Also feed every stream to the monitor ports
    #[serde(default)]
    pub duplicate_to_monitor: bool,

    /// (left, right) port names receiving the main mix
    pub main_port_names: (String, String),

    /// (left, right) port names of the monitor outputs
    pub monitor_port_names: (String, String),
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            target_device_name: "alsa_output.usb-multichannel".to_string(),
            duplicate_to_monitor: false,
            main_port_names: ("Playback_3".to_string(), "Playback_4".to_string()),
            monitor_port_names: ("Playback_1".to_string(), "Playback_2".to_string()),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_device_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target_device_name must not be empty".to_string(),
            ));
        }

        let (main_l, main_r) = &self.main_port_names;
        let (mon_l, mon_r) = &self.monitor_port_names;
        let names = [main_l, main_r, mon_l, mon_r];

        if names.iter().any(|n| n.is_empty()) {
            return Err(ConfigError::Invalid("port names must not be empty".to_string()));
        }
        if main_l == main_r {
            return Err(ConfigError::Invalid(format!(
                "main ports must differ, both are {main_l}"
            )));
        }
        if mon_l == mon_r {
            return Err(ConfigError::Invalid(format!(
                "monitor ports must differ, both are {mon_l}"
            )));
        }
        for main in [main_l, main_r] {
            if main == mon_l || main == mon_r {
                return Err(ConfigError::Invalid(format!(
                    "port {main} is configured as both main and monitor"
                )));
            }
        }

        Ok(())
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for any single graph query or mutation
    pub operation_timeout_ms: u64,

    /// Graph polling period for backends without native notifications
    pub poll_interval_ms: u64,

    /// How long a device must stay present before it is reported ready
    pub rediscovery_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 2000,
            poll_interval_ms: 500,
            rediscovery_debounce_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rediscovery_debounce(&self) -> Duration {
        Duration::from_millis(self.rediscovery_debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete patchbay configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchbayConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl PatchbayConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config = Self::from_toml(&contents)?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, self.to_toml()?).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.engine.validate()
    }
}

/// Configuration manager for the main patchbay config
///
/// Manages the configuration file at `~/.config/patchbay/config.toml`.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a manager for `<config_dir>/config.toml`
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_path: config_dir.join("config.toml"),
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/patchbay` on Linux
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("patchbay"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns the defaults.
    /// If the config file is corrupt or invalid, backs it up and returns the defaults.
    #[instrument(skip(self))]
    pub async fn load(&self) -> PatchbayConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, writing defaults"
            );

            let config = PatchbayConfig::default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default config"
                );
            }

            return config;
        }

        match PatchbayConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                PatchbayConfig::default()
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}

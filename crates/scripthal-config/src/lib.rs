//! Configuration management for scripthal
//!
//! Runtime limits, backend paths and the capability predicate for the HAL.
//! Settings live in a TOML file and can be overridden from the environment
//! with `SCRIPTHAL__<SECTION>__<KEY>` variables.

mod sections;

pub use sections::{Capabilities, HttpConfig, I2cSettings, SystemPaths, TimerConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Layered configuration error: {0}")]
    Layered(#[from] config::ConfigError),
}

/// Standard configuration paths
pub const CONFIG_DIR: &str = "/etc/scripthal";
pub const USER_CONFIG_DIR: &str = "/var/lib/scripthal";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "SCRIPTHAL";

/// Main HAL configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HalConfig {
    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub timers: TimerConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub i2c: I2cSettings,

    #[serde(default)]
    pub system: SystemPaths,
}

impl HalConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try user config first, then system config
        let user_config = Path::new(USER_CONFIG_DIR).join("hal.toml");
        if user_config.exists() {
            return Self::load(&user_config);
        }

        let system_config = Path::new(CONFIG_DIR).join("hal.toml");
        if system_config.exists() {
            return Self::load(&system_config);
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load a file (if given) with environment overrides layered on top
    pub fn load_layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            let contents = std::fs::read_to_string(path)?;
            builder = builder.add_source(config::File::from_str(
                &contents,
                config::FileFormat::Toml,
            ));
        }

        let layered = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = layered.try_deserialize()?;
        config.validate()?;
        tracing::debug!("Layered configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings that would make a subsystem unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timers.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "timers.max_pending must be at least 1".into(),
            ));
        }
        if self.http.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "http.max_in_flight must be at least 1".into(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "http.timeout_secs must be at least 1".into(),
            ));
        }
        if self.i2c.default_speed_hz == 0 {
            return Err(ConfigError::Invalid(
                "i2c.default_speed_hz must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

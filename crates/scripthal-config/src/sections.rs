//! Configuration sections

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Build-time capability flags, evaluated once at startup.
///
/// Defaults follow the crate's `js` and `gpio-api` features; a config file
/// can switch either off but the host decides once, before any script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Script engine support
    #[serde(default = "default_scripting")]
    pub scripting: bool,

    /// GPIO script API
    #[serde(default = "default_gpio_api")]
    pub gpio_api: bool,
}

fn default_scripting() -> bool {
    cfg!(feature = "js")
}

fn default_gpio_api() -> bool {
    cfg!(feature = "gpio-api")
}

impl Capabilities {
    /// Both flags must hold for GPIO bindings to register
    pub fn gpio_bindings_enabled(&self) -> bool {
        self.scripting && self.gpio_api
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            scripting: default_scripting(),
            gpio_api: default_gpio_api(),
        }
    }
}

/// Timer scheduler limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Maximum number of registrations waiting to fire
    #[serde(default = "default_max_timers")]
    pub max_pending: usize,
}

fn default_max_timers() -> usize {
    64
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_timers(),
        }
    }
}

/// HTTP client bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Maximum number of exchanges in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Whole-exchange timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("scripthal/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// I2C bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct I2cSettings {
    /// Buses scripts may open (empty = any)
    #[serde(default)]
    pub buses: Vec<u8>,

    /// Clock used when a script does not ask for one
    #[serde(default = "default_speed")]
    pub default_speed_hz: u32,

    /// Character device prefix, the bus number is appended
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,
}

fn default_speed() -> u32 {
    100_000
}

fn default_device_prefix() -> String {
    "/dev/i2c-".to_string()
}

impl Default for I2cSettings {
    fn default() -> Self {
        Self {
            buses: Vec::new(),
            default_speed_hz: default_speed(),
            device_prefix: default_device_prefix(),
        }
    }
}

/// Host system paths used by the Linux backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPaths {
    #[serde(default = "default_meminfo")]
    pub meminfo_path: PathBuf,

    /// Mount point whose usage is reported as filesystem usage
    #[serde(default = "default_fs_root")]
    pub fs_root: PathBuf,

    #[serde(default = "default_watchdog")]
    pub watchdog_device: PathBuf,
}

fn default_meminfo() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_watchdog() -> PathBuf {
    PathBuf::from("/dev/watchdog")
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            meminfo_path: default_meminfo(),
            fs_root: default_fs_root(),
            watchdog_device: default_watchdog(),
        }
    }
}

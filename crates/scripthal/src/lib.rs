//! Hardware Abstraction Layer (HAL) for embedded script engines
//!
//! Exposes native device facilities to a running script engine: memory and
//! filesystem introspection, watchdog and restart control, blocking delays,
//! one-shot timers, HTTP requests, I2C connections and GPIO bindings.
//!
//! The engine is abstracted behind [`ScriptEngine`]. Asynchronous operations
//! hold script callbacks as [`Callback`] handles that are invoked exactly
//! once, or released uninvoked on teardown.
//!
//! # Example
//!
//! ```no_run
//! use scripthal::Hal;
//! use scripthal::mock::MockEngine;
//! use scripthal_config::HalConfig;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), scripthal::HalError> {
//!     let config = HalConfig::load_default().unwrap_or_default();
//!     let mut engine = MockEngine::new();
//!     let mut hal: Hal<MockEngine> = Hal::linux(&config)?;
//!
//!     println!("Free heap: {} bytes", hal.heap_free_bytes()?);
//!
//!     let done = engine.function("done");
//!     hal.schedule_timeout(&mut engine, 250, &done)?;
//!     hal.run_until_idle(&mut engine).await;
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod engine;
pub mod gpio;
pub mod hal;
pub mod http;
pub mod i2c;
pub mod mock;
pub mod system;
pub mod timer;

pub use callback::Callback;
pub use engine::{EngineError, NativeFunction, NativeValue, ScriptEngine};
pub use gpio::{GpioDriver, PinMode, Pull, setup_gpio_bindings};
pub use hal::{Backends, CallbackSource, Hal, ReadyCallback, TeardownReport};
pub use http::{
    HttpBridge, HttpError, HttpOutcome, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, RequestId,
};
pub use i2c::{ConnectionId, I2cBackend, I2cBus, I2cConfig, I2cManager, LinuxI2cBackend};
pub use system::{LinuxSystem, SystemControl};
pub use timer::{TimerId, TimerScheduler};

use thiserror::Error;

/// Errors reported by HAL entry points
#[derive(Debug, Error)]
pub enum HalError {
    #[error("Callback is not callable")]
    NotCallable,

    #[error("Timer limit reached ({limit} pending)")]
    TimerCapacity { limit: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("HTTP request limit reached ({limit} in flight)")]
    HttpCapacity { limit: usize },

    #[error("HTTP client unavailable: {0}")]
    HttpClient(String),

    #[error("Invalid I2C configuration: {0}")]
    I2cConfig(String),

    #[error("I2C bus {bus} address {address:#04x} is already in use")]
    BusBusy { bus: u8, address: u16 },

    #[error("Failed to open I2C bus {bus}: {source}")]
    I2cOpen {
        bus: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("I2C connection {0} is already closed")]
    AlreadyClosed(u64),

    #[error("Unknown I2C connection {0}")]
    UnknownConnection(u64),

    #[error("Restart failed: {0}")]
    RestartFailed(String),

    #[error("No async runtime: {0}")]
    NoRuntime(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// HAL Result type
pub type Result<T> = std::result::Result<T, HalError>;

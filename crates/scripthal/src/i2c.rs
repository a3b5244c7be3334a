//! I2C connection manager
//!
//! Scripts open a connection by handing over configuration values and get
//! back an opaque [`ConnectionId`]. Every id must be closed exactly once;
//! a second close is reported as [`HalError::AlreadyClosed`].

use crate::engine::{NativeValue, ScriptEngine};
use crate::HalError;
use scripthal_config::I2cSettings;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;

// I2C_SLAVE from linux/i2c-dev.h
nix::ioctl_write_int_bad!(i2c_set_slave, 0x0703);

/// Validated bus session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cConfig {
    pub bus: u8,
    /// 7-bit device address
    pub address: u16,
    pub speed_hz: u32,
}

impl I2cConfig {
    /// Lowest non-reserved 7-bit address
    pub const MIN_ADDRESS: u16 = 0x08;
    /// Highest non-reserved 7-bit address
    pub const MAX_ADDRESS: u16 = 0x77;
    /// High-speed mode (3.4 MHz)
    pub const MAX_SPEED_HZ: u32 = 3_400_000;

    /// Parse script arguments: `{bus, address, speed?}` or `[bus, address, speed?]`
    pub fn from_native(value: &NativeValue, settings: &I2cSettings) -> Result<Self, HalError> {
        let (bus, address, speed) = match value {
            NativeValue::Object(_) => (
                value.get("bus"),
                value.get("address").or_else(|| value.get("addr")),
                value.get("speed").or_else(|| value.get("freq")),
            ),
            NativeValue::Array(items) => (items.first(), items.get(1), items.get(2)),
            other => {
                return Err(HalError::I2cConfig(format!(
                    "expected object or array, found {}",
                    other.type_name()
                )));
            }
        };

        let bus = required_integer("bus", bus)?;
        let address = required_integer("address", address)?;
        let speed = match speed {
            Some(value) if !value.is_nullish() => integer_field("speed", value)?,
            _ => u64::from(settings.default_speed_hz),
        };

        let bus = u8::try_from(bus)
            .map_err(|_| HalError::I2cConfig(format!("bus {} is out of range", bus)))?;
        if !settings.buses.is_empty() && !settings.buses.contains(&bus) {
            return Err(HalError::I2cConfig(format!("bus {} is not available", bus)));
        }

        let address = u16::try_from(address)
            .ok()
            .filter(|a| (Self::MIN_ADDRESS..=Self::MAX_ADDRESS).contains(a))
            .ok_or_else(|| {
                HalError::I2cConfig(format!(
                    "address {:#x} outside {:#04x}..={:#04x}",
                    address,
                    Self::MIN_ADDRESS,
                    Self::MAX_ADDRESS
                ))
            })?;

        let speed_hz = u32::try_from(speed)
            .ok()
            .filter(|s| (1..=Self::MAX_SPEED_HZ).contains(s))
            .ok_or_else(|| HalError::I2cConfig(format!("speed {} Hz is not supported", speed)))?;

        Ok(Self {
            bus,
            address,
            speed_hz,
        })
    }
}

fn required_integer(field: &str, value: Option<&NativeValue>) -> Result<u64, HalError> {
    match value {
        Some(value) => integer_field(field, value),
        None => Err(HalError::I2cConfig(format!("missing {}", field))),
    }
}

fn integer_field(field: &str, value: &NativeValue) -> Result<u64, HalError> {
    value
        .as_integer()
        .map_err(|e| HalError::I2cConfig(format!("{}: {}", field, e)))
}

/// Open bus session
pub trait I2cBus {
    fn write(&mut self, data: &[u8]) -> Result<(), HalError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<(), HalError>;

    /// Write then read, typically a register address followed by its value
    fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<(), HalError> {
        self.write(data)?;
        self.read(buf)
    }

    /// Release the session and its backing resource
    fn close(self: Box<Self>) -> Result<(), HalError>;
}

/// Claims bus sessions from the platform
pub trait I2cBackend {
    fn open(&mut self, config: &I2cConfig) -> Result<Box<dyn I2cBus>, HalError>;
}

/// Linux i2c-dev backend
pub struct LinuxI2cBackend {
    device_prefix: String,
}

impl LinuxI2cBackend {
    pub fn new(settings: &I2cSettings) -> Self {
        Self {
            device_prefix: settings.device_prefix.clone(),
        }
    }
}

impl I2cBackend for LinuxI2cBackend {
    fn open(&mut self, config: &I2cConfig) -> Result<Box<dyn I2cBus>, HalError> {
        let path = format!("{}{}", self.device_prefix, config.bus);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    HalError::I2cConfig(format!("bus {}: {} not present", config.bus, path))
                }
                _ => HalError::I2cOpen {
                    bus: config.bus,
                    source: e,
                },
            })?;

        match unsafe { i2c_set_slave(file.as_raw_fd(), libc::c_int::from(config.address)) } {
            Ok(_) => {}
            Err(nix::errno::Errno::EBUSY) => {
                return Err(HalError::BusBusy {
                    bus: config.bus,
                    address: config.address,
                });
            }
            Err(errno) => return Err(HalError::Sys(errno)),
        }

        // Bus clock is fixed by the adapter's device tree node
        tracing::debug!(
            "Opened {} for {:#04x} (requested {} Hz)",
            path,
            config.address,
            config.speed_hz
        );
        Ok(Box::new(LinuxI2cBus { file }))
    }
}

struct LinuxI2cBus {
    file: File,
}

impl I2cBus for LinuxI2cBus {
    fn write(&mut self, data: &[u8]) -> Result<(), HalError> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), HalError> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), HalError> {
        drop(self.file);
        Ok(())
    }
}

/// Handle returned to scripts for an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

struct OpenConnection {
    config: I2cConfig,
    bus: Box<dyn I2cBus>,
}

/// Creates and destroys I2C connection handles
pub struct I2cManager {
    backend: Box<dyn I2cBackend>,
    settings: I2cSettings,
    open: HashMap<ConnectionId, OpenConnection>,
    next_id: u64,
}

impl I2cManager {
    pub fn new(backend: Box<dyn I2cBackend>, settings: I2cSettings) -> Self {
        Self {
            backend,
            settings,
            open: HashMap::new(),
            next_id: 0,
        }
    }

    /// Open a connection from engine-supplied configuration values
    pub fn open<E: ScriptEngine>(
        &mut self,
        engine: &E,
        args: &E::Value,
    ) -> Result<ConnectionId, HalError> {
        let native = engine
            .to_native(args)
            .ok_or_else(|| HalError::I2cConfig("arguments must be plain data".into()))?;
        let config = I2cConfig::from_native(&native, &self.settings)?;
        self.open_config(config)
    }

    /// Open a connection from an already validated configuration
    pub fn open_config(&mut self, config: I2cConfig) -> Result<ConnectionId, HalError> {
        let claimed = self
            .open
            .values()
            .any(|c| c.config.bus == config.bus && c.config.address == config.address);
        if claimed {
            return Err(HalError::BusBusy {
                bus: config.bus,
                address: config.address,
            });
        }

        let bus = self.backend.open(&config)?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.open.insert(id, OpenConnection { config, bus });

        tracing::info!(
            "I2C connection {} opened on bus {} address {:#04x}",
            id.0,
            config.bus,
            config.address
        );
        Ok(id)
    }

    /// Close a connection. Closing twice is an error, not a no-op.
    pub fn close(&mut self, id: ConnectionId) -> Result<(), HalError> {
        match self.open.remove(&id) {
            Some(connection) => {
                tracing::info!("I2C connection {} closed", id.0);
                connection.bus.close()
            }
            None => Err(self.missing(id)),
        }
    }

    pub fn write(&mut self, id: ConnectionId, data: &[u8]) -> Result<(), HalError> {
        self.connection(id)?.bus.write(data)
    }

    pub fn read(&mut self, id: ConnectionId, len: usize) -> Result<Vec<u8>, HalError> {
        let mut buf = vec![0u8; len];
        self.connection(id)?.bus.read(&mut buf)?;
        Ok(buf)
    }

    pub fn write_read(
        &mut self,
        id: ConnectionId,
        data: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, HalError> {
        let mut buf = vec![0u8; len];
        self.connection(id)?.bus.write_read(data, &mut buf)?;
        Ok(buf)
    }

    /// Open connections ordered by id
    pub fn live_connections(&self) -> Vec<(ConnectionId, I2cConfig)> {
        let mut live: Vec<_> = self.open.iter().map(|(id, c)| (*id, c.config)).collect();
        live.sort_by_key(|(id, _)| *id);
        live
    }

    /// Force-close every open connection, returning how many were closed
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<ConnectionId> = self.live_connections().into_iter().map(|(id, _)| id).collect();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.close(id) {
                tracing::warn!("Failed to close I2C connection {}: {}", id.0, e);
            }
        }
        count
    }

    fn connection(&mut self, id: ConnectionId) -> Result<&mut OpenConnection, HalError> {
        let missing = self.missing(id);
        self.open.get_mut(&id).ok_or(missing)
    }

    fn missing(&self, id: ConnectionId) -> HalError {
        if id.0 < self.next_id {
            HalError::AlreadyClosed(id.0)
        } else {
            HalError::UnknownConnection(id.0)
        }
    }
}

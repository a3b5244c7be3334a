//! GPIO script bindings
//!
//! Registration only. Pin-level work belongs to a [`GpioDriver`] supplied by
//! the platform.

use crate::engine::{EngineError, NativeValue, ScriptEngine};
use crate::HalError;
use scripthal_config::Capabilities;
use std::cell::RefCell;
use std::rc::Rc;

/// Namespace the bindings are installed under
pub const GPIO_NAMESPACE: &str = "GPIO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

impl PinMode {
    /// Script-side numeric code
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

impl Pull {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Pull::None),
            1 => Some(Pull::Up),
            2 => Some(Pull::Down),
            _ => None,
        }
    }
}

/// Pin-level driver the bindings forward to
pub trait GpioDriver {
    fn set_mode(&mut self, pin: u32, mode: PinMode, pull: Pull) -> Result<(), HalError>;

    fn read(&mut self, pin: u32) -> Result<bool, HalError>;

    fn write(&mut self, pin: u32, level: bool) -> Result<(), HalError>;

    /// Invert the output level, returning the new level
    fn toggle(&mut self, pin: u32) -> Result<bool, HalError>;
}

type SharedDriver = Rc<RefCell<Box<dyn GpioDriver>>>;

/// Install `GPIO.setMode`, `GPIO.read`, `GPIO.write` and `GPIO.toggle`.
///
/// Returns `Ok(false)` without touching the engine when the capability
/// predicate does not hold.
pub fn setup_gpio_bindings<E>(
    engine: &mut E,
    capabilities: &Capabilities,
    driver: Box<dyn GpioDriver>,
) -> Result<bool, HalError>
where
    E: ScriptEngine + 'static,
{
    if !capabilities.gpio_bindings_enabled() {
        tracing::debug!(
            "GPIO bindings disabled (scripting={}, gpio_api={})",
            capabilities.scripting,
            capabilities.gpio_api
        );
        return Ok(false);
    }

    let driver: SharedDriver = Rc::new(RefCell::new(driver));

    let d = Rc::clone(&driver);
    engine.register_function(
        GPIO_NAMESPACE,
        "setMode",
        Box::new(move |engine: &mut E, args: &[E::Value]| {
            let pin = pin_arg(engine, args)?;
            let mode = integer_arg(engine, args, 1, "mode")?;
            let mode = PinMode::from_code(mode).ok_or_else(|| {
                EngineError::Exception(format!("invalid pin mode {}", mode))
            })?;
            let pull = match args.get(2).and_then(|v| engine.to_native(v)) {
                Some(value) if !value.is_nullish() => {
                    let code = value.as_integer()?;
                    Pull::from_code(code).ok_or_else(|| {
                        EngineError::Exception(format!("invalid pull {}", code))
                    })?
                }
                _ => Pull::None,
            };
            d.borrow_mut()
                .set_mode(pin, mode, pull)
                .map_err(script_error)?;
            Ok(engine.to_value(NativeValue::Bool(true)))
        }),
    )?;

    let d = Rc::clone(&driver);
    engine.register_function(
        GPIO_NAMESPACE,
        "read",
        Box::new(move |engine: &mut E, args: &[E::Value]| {
            let pin = pin_arg(engine, args)?;
            let level = d.borrow_mut().read(pin).map_err(script_error)?;
            Ok(engine.to_value(level_value(level)))
        }),
    )?;

    let d = Rc::clone(&driver);
    engine.register_function(
        GPIO_NAMESPACE,
        "write",
        Box::new(move |engine: &mut E, args: &[E::Value]| {
            let pin = pin_arg(engine, args)?;
            let level = args
                .get(1)
                .and_then(|v| engine.to_native(v))
                .and_then(|v| v.as_bool())
                .ok_or(EngineError::TypeMismatch {
                    expected: "level",
                    found: "missing",
                })?;
            d.borrow_mut().write(pin, level).map_err(script_error)?;
            Ok(engine.to_value(NativeValue::Bool(true)))
        }),
    )?;

    let d = driver;
    engine.register_function(
        GPIO_NAMESPACE,
        "toggle",
        Box::new(move |engine: &mut E, args: &[E::Value]| {
            let pin = pin_arg(engine, args)?;
            let level = d.borrow_mut().toggle(pin).map_err(script_error)?;
            Ok(engine.to_value(level_value(level)))
        }),
    )?;

    tracing::info!("GPIO bindings registered");
    Ok(true)
}

fn level_value(level: bool) -> NativeValue {
    NativeValue::Number(if level { 1.0 } else { 0.0 })
}

fn script_error(err: HalError) -> EngineError {
    EngineError::Exception(err.to_string())
}

fn pin_arg<E: ScriptEngine>(engine: &E, args: &[E::Value]) -> Result<u32, EngineError> {
    let pin = integer_arg(engine, args, 0, "pin")?;
    u32::try_from(pin).map_err(|_| EngineError::Exception(format!("pin {} out of range", pin)))
}

fn integer_arg<E: ScriptEngine>(
    engine: &E,
    args: &[E::Value],
    index: usize,
    name: &'static str,
) -> Result<u64, EngineError> {
    match args.get(index).and_then(|v| engine.to_native(v)) {
        Some(value) => value.as_integer(),
        None => Err(EngineError::TypeMismatch {
            expected: name,
            found: "missing",
        }),
    }
}

//! Script engine abstraction
//!
//! The HAL never looks inside an engine's value representation. Everything it
//! needs is expressed as a small capability set: check a value is callable,
//! keep it alive across an asynchronous gap, invoke it, and convert between
//! engine values and [`NativeValue`] data.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Value is not callable")]
    NotCallable,

    #[error("Script raised: {0}")]
    Exception(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Engine-independent data crossing the HAL boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NativeValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<NativeValue>),
    Object(BTreeMap<String, NativeValue>),
}

impl NativeValue {
    /// Build an object from key/value pairs
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, NativeValue)>,
    {
        NativeValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Name of the variant, used in type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeValue::Undefined => "undefined",
            NativeValue::Null => "null",
            NativeValue::Bool(_) => "boolean",
            NativeValue::Number(_) => "number",
            NativeValue::String(_) => "string",
            NativeValue::Bytes(_) => "bytes",
            NativeValue::Array(_) => "array",
            NativeValue::Object(_) => "object",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NativeValue::Bool(b) => Some(*b),
            NativeValue::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Field lookup on objects, `None` for everything else
    pub fn get(&self, key: &str) -> Option<&NativeValue> {
        match self {
            NativeValue::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, NativeValue::Undefined | NativeValue::Null)
    }

    /// Interpret as a non-negative integer that fits in `u64`
    pub fn as_integer(&self) -> Result<u64, EngineError> {
        match self {
            NativeValue::Number(n) if n.is_finite() && *n >= 0.0 && n.fract() == 0.0 => {
                Ok(*n as u64)
            }
            other => Err(EngineError::TypeMismatch {
                expected: "non-negative integer",
                found: other.type_name(),
            }),
        }
    }
}

impl From<bool> for NativeValue {
    fn from(value: bool) -> Self {
        NativeValue::Bool(value)
    }
}

impl From<f64> for NativeValue {
    fn from(value: f64) -> Self {
        NativeValue::Number(value)
    }
}

impl From<u32> for NativeValue {
    fn from(value: u32) -> Self {
        NativeValue::Number(value.into())
    }
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        NativeValue::String(value.to_string())
    }
}

impl From<String> for NativeValue {
    fn from(value: String) -> Self {
        NativeValue::String(value)
    }
}

impl From<Vec<u8>> for NativeValue {
    fn from(value: Vec<u8>) -> Self {
        NativeValue::Bytes(value)
    }
}

/// Native function exposed to scripts
pub type NativeFunction<E> = Box<
    dyn FnMut(
        &mut E,
        &[<E as ScriptEngine>::Value],
    ) -> Result<<E as ScriptEngine>::Value, EngineError>,
>;

/// Capabilities the HAL requires from a running script engine.
///
/// The engine is borrowed per call and is only ever touched from the thread
/// that dispatches callbacks.
pub trait ScriptEngine: Sized {
    /// Engine-owned value (numbers, strings, functions, ...)
    type Value: Clone;

    /// Whether `value` can be invoked
    fn is_callable(&self, value: &Self::Value) -> bool;

    /// Take a durable reference so `value` survives until [`release`](Self::release)
    fn retain(&mut self, value: &Self::Value);

    /// Drop a reference previously taken with [`retain`](Self::retain)
    fn release(&mut self, value: &Self::Value);

    /// Invoke a callable value on the engine's callback path
    fn invoke(&mut self, callback: &Self::Value, args: Vec<Self::Value>)
    -> Result<(), EngineError>;

    /// Construct an engine value from native data
    fn to_value(&mut self, native: NativeValue) -> Self::Value;

    /// Read an engine value as native data; `None` for functions and other
    /// values without a native form
    fn to_native(&self, value: &Self::Value) -> Option<NativeValue>;

    /// Install a native function as `namespace.name`
    fn register_function(
        &mut self,
        namespace: &str,
        name: &str,
        function: NativeFunction<Self>,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversion() {
        assert_eq!(NativeValue::Number(42.0).as_integer(), Ok(42));
        assert!(NativeValue::Number(-1.0).as_integer().is_err());
        assert!(NativeValue::Number(1.5).as_integer().is_err());
        assert!(NativeValue::Number(f64::NAN).as_integer().is_err());
        assert_eq!(
            NativeValue::from("7").as_integer(),
            Err(EngineError::TypeMismatch {
                expected: "non-negative integer",
                found: "string",
            })
        );
    }

    #[test]
    fn test_object_lookup() {
        let value = NativeValue::object([("bus", NativeValue::from(1u32))]);
        assert_eq!(value.get("bus").and_then(NativeValue::as_f64), Some(1.0));
        assert!(value.get("address").is_none());
        assert!(NativeValue::Null.get("bus").is_none());
    }

    #[test]
    fn test_serializes_as_plain_json() {
        let value = NativeValue::object([
            ("ok", NativeValue::Bool(true)),
            ("status", NativeValue::from(200u32)),
            ("error", NativeValue::Null),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"error":null,"ok":true,"status":200.0}"#);
    }
}

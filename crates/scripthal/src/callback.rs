//! Durable callback handles
//!
//! A [`Callback`] is the HAL's hold on a script function across an
//! asynchronous gap. It is consumed by exactly one of [`Callback::invoke`] or
//! [`Callback::release`], so a callback cannot be fired twice, and a handle
//! that is dropped without either is reported as a leak.

use crate::engine::{EngineError, ScriptEngine};
use crate::HalError;

#[must_use = "a callback must be invoked or released"]
pub struct Callback<V> {
    value: Option<V>,
}

impl<V: Clone> Callback<V> {
    /// Take a durable reference to `value`
    pub fn retain<E>(engine: &mut E, value: &V) -> Result<Self, HalError>
    where
        E: ScriptEngine<Value = V>,
    {
        if !engine.is_callable(value) {
            return Err(HalError::NotCallable);
        }
        engine.retain(value);
        Ok(Self {
            value: Some(value.clone()),
        })
    }

    /// Invoke the callback once and drop the durable reference
    pub fn invoke<E>(mut self, engine: &mut E, args: Vec<V>) -> Result<(), EngineError>
    where
        E: ScriptEngine<Value = V>,
    {
        match self.value.take() {
            Some(value) => {
                let result = engine.invoke(&value, args);
                engine.release(&value);
                result
            }
            None => Ok(()),
        }
    }

    /// Drop the durable reference without invoking
    pub fn release<E>(mut self, engine: &mut E)
    where
        E: ScriptEngine<Value = V>,
    {
        if let Some(value) = self.value.take() {
            engine.release(&value);
        }
    }
}

impl<V> Drop for Callback<V> {
    fn drop(&mut self) {
        if self.value.is_some() {
            tracing::warn!("Callback dropped without being invoked or released");
        }
    }
}

impl<V> std::fmt::Debug for Callback<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.value.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeValue;
    use crate::mock::MockEngine;

    #[test]
    fn test_invoke_releases_reference() {
        let mut engine = MockEngine::new();
        let f = engine.function("cb");

        let callback = Callback::retain(&mut engine, &f).unwrap();
        assert_eq!(engine.retained_count(), 1);

        callback
            .invoke(&mut engine, vec![engine_value(7.0)])
            .unwrap();

        assert_eq!(engine.retained_count(), 0);
        assert_eq!(engine.invocations("cb"), vec![vec![NativeValue::Number(7.0)]]);
    }

    #[test]
    fn test_release_does_not_invoke() {
        let mut engine = MockEngine::new();
        let f = engine.function("cb");

        let callback = Callback::retain(&mut engine, &f).unwrap();
        callback.release(&mut engine);

        assert_eq!(engine.retained_count(), 0);
        assert!(engine.invocations("cb").is_empty());
    }

    #[test]
    fn test_non_callable_is_rejected() {
        let mut engine = MockEngine::new();
        let value = engine.to_value(NativeValue::from("not a function"));

        let err = Callback::retain(&mut engine, &value).unwrap_err();
        assert!(matches!(err, HalError::NotCallable));
        assert_eq!(engine.retained_count(), 0);
    }

    #[test]
    fn test_exception_still_releases() {
        let mut engine = MockEngine::new();
        let f = engine.throwing_function("boom");

        let callback = Callback::retain(&mut engine, &f).unwrap();
        let result = callback.invoke(&mut engine, Vec::new());

        assert!(matches!(result, Err(EngineError::Exception(_))));
        assert_eq!(engine.retained_count(), 0);
    }

    fn engine_value(n: f64) -> crate::mock::MockValue {
        crate::mock::MockValue::Data(NativeValue::Number(n))
    }
}

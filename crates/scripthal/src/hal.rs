//! HAL facade and callback dispatcher
//!
//! [`Hal`] bundles every entry point a script engine calls into. Async
//! results are never delivered from inside the entry point that started
//! them: they wait for the next [`Hal::dispatch`] tick, which runs on the
//! engine's own thread.

use crate::callback::Callback;
use crate::engine::{EngineError, NativeValue, ScriptEngine};
use crate::gpio::{self, GpioDriver};
use crate::http::{self, HttpBridge, HttpTransport, ReqwestTransport, RequestId};
use crate::i2c::{ConnectionId, I2cBackend, I2cManager, LinuxI2cBackend};
use crate::system::{LinuxSystem, SystemControl};
use crate::timer::{TimerId, TimerScheduler};
use crate::HalError;
use scripthal_config::{Capabilities, HalConfig};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Platform implementations plugged into a [`Hal`]
pub struct Backends {
    pub system: Box<dyn SystemControl>,
    pub i2c: Box<dyn I2cBackend>,
    pub http: Arc<dyn HttpTransport>,
}

impl Backends {
    /// Linux backends configured from `config`
    pub fn linux(config: &HalConfig) -> Result<Self, HalError> {
        Ok(Self {
            system: Box::new(LinuxSystem::new(config.system.clone())),
            i2c: Box::new(LinuxI2cBackend::new(&config.i2c)),
            http: Arc::new(ReqwestTransport::new(&config.http)?),
        })
    }
}

/// Which asynchronous operation a ready callback belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSource {
    Timer(TimerId),
    Http(RequestId),
}

/// A callback whose operation has completed and is waiting to run
#[derive(Debug)]
pub struct ReadyCallback<V> {
    source: CallbackSource,
    callback: Callback<V>,
    payload: Option<NativeValue>,
}

impl<V: Clone> ReadyCallback<V> {
    pub fn source(&self) -> CallbackSource {
        self.source
    }

    /// Argument the callback will receive, if any
    pub fn payload(&self) -> Option<&NativeValue> {
        self.payload.as_ref()
    }

    /// Invoke the callback with its payload
    pub fn fire<E>(self, engine: &mut E) -> Result<(), EngineError>
    where
        E: ScriptEngine<Value = V>,
    {
        let args = match self.payload {
            Some(payload) => vec![engine.to_value(payload)],
            None => Vec::new(),
        };
        self.callback.invoke(engine, args)
    }

    /// Drop the callback without invoking it
    pub fn release<E>(self, engine: &mut E)
    where
        E: ScriptEngine<Value = V>,
    {
        self.callback.release(engine);
    }
}

/// What [`Hal::teardown`] cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub timers_released: usize,
    pub requests_abandoned: usize,
    pub connections_closed: usize,
}

/// Hardware abstraction layer bound to one script engine type
pub struct Hal<E: ScriptEngine> {
    system: Box<dyn SystemControl>,
    timers: TimerScheduler<E::Value>,
    http: HttpBridge<E::Value>,
    i2c: I2cManager,
    capabilities: Capabilities,
}

impl<E: ScriptEngine> Hal<E> {
    /// Build a HAL around explicit backends.
    ///
    /// HTTP exchanges are spawned on `runtime`; with a current-thread runtime
    /// they only make progress while the host awaits
    /// [`run_until_idle`](Self::run_until_idle).
    pub fn new(config: &HalConfig, backends: Backends, runtime: Handle) -> Self {
        tracing::info!(
            "HAL initialised (timers<={}, http<={}, gpio={})",
            config.timers.max_pending,
            config.http.max_in_flight,
            config.capabilities.gpio_bindings_enabled()
        );

        Self {
            system: backends.system,
            timers: TimerScheduler::new(config.timers.max_pending),
            http: HttpBridge::new(backends.http, runtime, config.http.max_in_flight),
            i2c: I2cManager::new(backends.i2c, config.i2c.clone()),
            capabilities: config.capabilities,
        }
    }

    /// Linux HAL on the current tokio runtime
    pub fn linux(config: &HalConfig) -> Result<Self, HalError> {
        let runtime = Handle::try_current().map_err(|e| HalError::NoRuntime(e.to_string()))?;
        Ok(Self::new(config, Backends::linux(config)?, runtime))
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn heap_free_bytes(&self) -> Result<u64, HalError> {
        self.system.heap_free_bytes()
    }

    pub fn fs_usage_bytes(&self) -> Result<u64, HalError> {
        self.system.fs_usage_bytes()
    }

    pub fn feed_watchdog(&mut self) -> Result<(), HalError> {
        self.system.feed_watchdog()
    }

    /// Restart the device; does not return on real hardware
    pub fn restart_system(&mut self) -> Result<(), HalError> {
        self.system.restart_system()
    }

    /// Blocking delay; stalls every pending callback while it runs
    pub fn sleep_microseconds(&self, duration_us: u64) {
        self.system.sleep_microseconds(duration_us);
    }

    /// Fire `callback` once, no earlier than `delay_ms` from now
    pub fn schedule_timeout(
        &mut self,
        engine: &mut E,
        delay_ms: u64,
        callback: &E::Value,
    ) -> Result<TimerId, HalError> {
        self.timers.schedule(engine, delay_ms, callback)
    }

    /// Start an HTTP exchange; see [`HttpBridge::call`] for the callback
    /// contract
    pub fn http_call(
        &mut self,
        engine: &mut E,
        url: &str,
        body: &[u8],
        method: &str,
        callback: &E::Value,
    ) -> Result<RequestId, HalError> {
        self.http.call(engine, url, body, method, callback)
    }

    pub fn i2c_open(&mut self, engine: &E, args: &E::Value) -> Result<ConnectionId, HalError> {
        self.i2c.open(engine, args)
    }

    pub fn i2c_close(&mut self, connection: ConnectionId) -> Result<(), HalError> {
        self.i2c.close(connection)
    }

    /// Connection manager, for reads and writes on open handles
    pub fn i2c(&mut self) -> &mut I2cManager {
        &mut self.i2c
    }

    /// Register GPIO bindings if the capability predicate allows it
    pub fn setup_gpio_bindings(
        &self,
        engine: &mut E,
        driver: Box<dyn GpioDriver>,
    ) -> Result<bool, HalError>
    where
        E: 'static,
    {
        gpio::setup_gpio_bindings(engine, &self.capabilities, driver)
    }

    /// Nothing scheduled and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.timers.is_empty() && self.http.is_idle()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn requests_in_flight(&self) -> usize {
        self.http.in_flight()
    }

    /// Collect every callback that is ready to run, timers first.
    ///
    /// Hosts that keep the HAL behind a `RefCell` use this to drop their
    /// borrow before firing, so callbacks may call back into the HAL.
    pub fn take_ready(&mut self) -> Vec<ReadyCallback<E::Value>> {
        let mut ready: Vec<ReadyCallback<E::Value>> = self
            .timers
            .take_due(Instant::now())
            .into_iter()
            .map(|(id, callback)| ReadyCallback {
                source: CallbackSource::Timer(id),
                callback,
                payload: None,
            })
            .collect();

        for (id, callback, outcome) in self.http.take_completed() {
            if let Err(e) = &outcome {
                tracing::debug!("HTTP request {} failed: {}", id.as_u64(), e);
            }
            ready.push(ReadyCallback {
                source: CallbackSource::Http(id),
                callback,
                payload: Some(http::outcome_to_native(outcome)),
            });
        }

        ready
    }

    /// One event-loop tick: run every ready callback, returning how many ran.
    ///
    /// A callback that raises is logged and does not stop the tick.
    pub fn dispatch(&mut self, engine: &mut E) -> usize {
        let ready = self.take_ready();
        let fired = ready.len();
        for callback in ready {
            let source = callback.source();
            if let Err(e) = callback.fire(engine) {
                tracing::warn!("{:?} callback raised: {}", source, e);
            }
        }
        fired
    }

    /// Dispatch until no timer is pending and no request is in flight
    pub async fn run_until_idle(&mut self, engine: &mut E) {
        loop {
            self.dispatch(engine);
            if self.is_idle() {
                return;
            }

            let deadline = self.timers.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let completion = tokio::select! {
                completion = self.http.recv_completion() => completion,
                _ = timer => None,
            };
            if let Some(completion) = completion {
                self.http.push_ready(completion);
            }
        }
    }

    /// Release every pending callback without invoking it, abort in-flight
    /// requests and force-close open I2C connections
    pub fn teardown(mut self, engine: &mut E) -> TeardownReport {
        let report = TeardownReport {
            timers_released: self.timers.release_all(engine),
            requests_abandoned: self.http.abandon_all(engine),
            connections_closed: self.i2c.close_all(),
        };
        tracing::info!(
            "HAL torn down: {} timers released, {} requests abandoned, {} connections closed",
            report.timers_released,
            report.requests_abandoned,
            report.connections_closed
        );
        report
    }
}

//! Mock implementations for testing without real hardware
//!
//! This module provides a recording script engine and mock backends for
//! every HAL component, so the whole contract can be exercised on a desktop.
//! Backends are cheap to clone; clones share state through `Arc<RwLock<_>>`
//! so a test can keep a handle after moving the backend into a [`Hal`].
//!
//! # Usage
//!
//! ```no_run
//! use scripthal::mock::{MockBackends, MockEngine};
//! use scripthal::Hal;
//! use scripthal_config::HalConfig;
//!
//! # async fn demo() {
//! let mocks = MockBackends::new();
//! let mut hal: Hal<MockEngine> =
//!     Hal::new(&HalConfig::default(), mocks.backends(), tokio::runtime::Handle::current());
//! let mut engine = MockEngine::new();
//! let cb = engine.function("cb");
//! hal.schedule_timeout(&mut engine, 10, &cb).unwrap();
//! hal.run_until_idle(&mut engine).await;
//! assert_eq!(engine.invocations("cb").len(), 1);
//! # }
//! ```

use crate::engine::{EngineError, NativeFunction, NativeValue, ScriptEngine};
use crate::gpio::{GpioDriver, PinMode, Pull};
use crate::hal::Backends;
use crate::http::{HttpOutcome, HttpRequest, HttpResponse, HttpTransport};
use crate::i2c::{I2cBackend, I2cBus, I2cConfig};
use crate::system::SystemControl;
use crate::HalError;
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Value type of [`MockEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    Data(NativeValue),
    Function(u32),
}

struct MockFunction {
    label: String,
    throws: bool,
}

/// Script engine that records retains, releases and invocations
#[derive(Default)]
pub struct MockEngine {
    functions: Vec<MockFunction>,
    retained: HashMap<u32, usize>,
    over_released: usize,
    invocations: Vec<(u32, Vec<NativeValue>)>,
    registered: BTreeMap<String, Option<NativeFunction<MockEngine>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap native data as an engine value
    pub fn data(value: NativeValue) -> MockValue {
        MockValue::Data(value)
    }

    /// Create a script function identified by `label` in the invocation log
    pub fn function(&mut self, label: &str) -> MockValue {
        self.add_function(label, false)
    }

    /// Create a script function that raises every time it is invoked
    pub fn throwing_function(&mut self, label: &str) -> MockValue {
        self.add_function(label, true)
    }

    fn add_function(&mut self, label: &str, throws: bool) -> MockValue {
        let id = self.functions.len() as u32;
        self.functions.push(MockFunction {
            label: label.to_string(),
            throws,
        });
        MockValue::Function(id)
    }

    /// Durable references currently held
    pub fn retained_count(&self) -> usize {
        self.retained.values().sum()
    }

    /// Releases without a matching retain
    pub fn over_released(&self) -> usize {
        self.over_released
    }

    /// Arguments of every invocation of `label`, oldest first
    pub fn invocations(&self, label: &str) -> Vec<Vec<NativeValue>> {
        self.invocations
            .iter()
            .filter(|(id, _)| self.label(*id) == Some(label))
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Labels of invoked functions in invocation order
    pub fn invocation_order(&self) -> Vec<String> {
        self.invocations
            .iter()
            .filter_map(|(id, _)| self.label(*id).map(str::to_string))
            .collect()
    }

    /// Qualified names of registered native functions, sorted
    pub fn registered_functions(&self) -> Vec<String> {
        self.registered.keys().cloned().collect()
    }

    /// Call a registered native function the way a script would
    pub fn call(&mut self, name: &str, args: Vec<NativeValue>) -> Result<NativeValue, EngineError> {
        let mut function = self
            .registered
            .get_mut(name)
            .and_then(Option::take)
            .ok_or_else(|| EngineError::Exception(format!("{} is not a function", name)))?;

        let args: Vec<MockValue> = args.into_iter().map(MockValue::Data).collect();
        let result = function(self, &args);
        self.registered.insert(name.to_string(), Some(function));

        result.map(|value| self.to_native(&value).unwrap_or(NativeValue::Undefined))
    }

    fn label(&self, id: u32) -> Option<&str> {
        self.functions.get(id as usize).map(|f| f.label.as_str())
    }
}

impl ScriptEngine for MockEngine {
    type Value = MockValue;

    fn is_callable(&self, value: &MockValue) -> bool {
        matches!(value, MockValue::Function(id) if (*id as usize) < self.functions.len())
    }

    fn retain(&mut self, value: &MockValue) {
        if let MockValue::Function(id) = value {
            *self.retained.entry(*id).or_insert(0) += 1;
        }
    }

    fn release(&mut self, value: &MockValue) {
        if let MockValue::Function(id) = value {
            match self.retained.get_mut(id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.retained.remove(id);
                }
                None => self.over_released += 1,
            }
        }
    }

    fn invoke(&mut self, callback: &MockValue, args: Vec<MockValue>) -> Result<(), EngineError> {
        let MockValue::Function(id) = callback else {
            return Err(EngineError::NotCallable);
        };
        let args = args
            .iter()
            .map(|a| self.to_native(a).unwrap_or(NativeValue::Undefined))
            .collect();
        self.invocations.push((*id, args));

        match self.functions.get(*id as usize) {
            Some(f) if f.throws => Err(EngineError::Exception(format!("{} threw", f.label))),
            Some(_) => Ok(()),
            None => Err(EngineError::NotCallable),
        }
    }

    fn to_value(&mut self, native: NativeValue) -> MockValue {
        MockValue::Data(native)
    }

    fn to_native(&self, value: &MockValue) -> Option<NativeValue> {
        match value {
            MockValue::Data(native) => Some(native.clone()),
            MockValue::Function(_) => None,
        }
    }

    fn register_function(
        &mut self,
        namespace: &str,
        name: &str,
        function: NativeFunction<Self>,
    ) -> Result<(), EngineError> {
        let qualified = format!("{}.{}", namespace, name);
        if self.registered.contains_key(&qualified) {
            return Err(EngineError::Registration(format!(
                "{} already registered",
                qualified
            )));
        }
        self.registered.insert(qualified, Some(function));
        Ok(())
    }
}

/// Shared mock system state
#[derive(Debug)]
pub struct MockSystemState {
    pub heap_free: u64,
    pub fs_used: u64,
    pub watchdog_feeds: u32,
    pub restarts: u32,
    pub slept_us: u64,
    /// Make introspection queries fail
    pub fail_queries: bool,
}

impl Default for MockSystemState {
    fn default() -> Self {
        Self {
            heap_free: 48 * 1024,
            fs_used: 128 * 1024,
            watchdog_feeds: 0,
            restarts: 0,
            slept_us: 0,
            fail_queries: false,
        }
    }
}

/// Mock introspection, watchdog and power control
#[derive(Clone, Default)]
pub struct MockSystem {
    state: Arc<RwLock<MockSystemState>>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get shared state for manipulation in tests
    pub fn state(&self) -> Arc<RwLock<MockSystemState>> {
        Arc::clone(&self.state)
    }

    fn query(&self, read: impl Fn(&MockSystemState) -> u64) -> Result<u64, HalError> {
        let state = self
            .state
            .read()
            .map_err(|_| HalError::Io(std::io::Error::other("mock state poisoned")))?;
        if state.fail_queries {
            return Err(HalError::Io(std::io::Error::other("query failed")));
        }
        Ok(read(&state))
    }
}

impl SystemControl for MockSystem {
    fn heap_free_bytes(&self) -> Result<u64, HalError> {
        self.query(|s| s.heap_free)
    }

    fn fs_usage_bytes(&self) -> Result<u64, HalError> {
        self.query(|s| s.fs_used)
    }

    fn feed_watchdog(&mut self) -> Result<(), HalError> {
        if let Ok(mut state) = self.state.write() {
            state.watchdog_feeds += 1;
        }
        tracing::debug!("[MOCK] Watchdog fed");
        Ok(())
    }

    fn restart_system(&mut self) -> Result<(), HalError> {
        if let Ok(mut state) = self.state.write() {
            state.restarts += 1;
        }
        tracing::debug!("[MOCK] System restart requested");
        Ok(())
    }

    fn sleep_microseconds(&self, duration_us: u64) {
        if let Ok(mut state) = self.state.write() {
            state.slept_us += duration_us;
        }
        std::thread::sleep(Duration::from_micros(duration_us));
    }
}

#[derive(Debug, Default)]
struct MockI2cState {
    buses: Vec<u8>,
    open: HashSet<(u8, u16)>,
    opened_total: usize,
    written: HashMap<(u8, u16), Vec<Vec<u8>>>,
    reads: HashMap<(u8, u16), VecDeque<u8>>,
}

/// Mock I2C platform with a fixed set of buses
#[derive(Clone)]
pub struct MockI2cBackend {
    state: Arc<RwLock<MockI2cState>>,
}

impl MockI2cBackend {
    pub fn new(buses: &[u8]) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockI2cState {
                buses: buses.to_vec(),
                ..Default::default()
            })),
        }
    }

    /// Sessions currently claimed
    pub fn open_sessions(&self) -> usize {
        self.state.read().map(|s| s.open.len()).unwrap_or(0)
    }

    /// Sessions ever claimed
    pub fn opened_total(&self) -> usize {
        self.state.read().map(|s| s.opened_total).unwrap_or(0)
    }

    /// Bytes the device at `bus`/`address` will return on reads
    pub fn queue_read(&self, bus: u8, address: u16, bytes: &[u8]) {
        if let Ok(mut state) = self.state.write() {
            state
                .reads
                .entry((bus, address))
                .or_default()
                .extend(bytes.iter().copied());
        }
    }

    /// Every write made to the device at `bus`/`address`
    pub fn written(&self, bus: u8, address: u16) -> Vec<Vec<u8>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.written.get(&(bus, address)).cloned())
            .unwrap_or_default()
    }
}

impl I2cBackend for MockI2cBackend {
    fn open(&mut self, config: &I2cConfig) -> Result<Box<dyn I2cBus>, HalError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| HalError::Io(std::io::Error::other("mock state poisoned")))?;

        if !state.buses.contains(&config.bus) {
            return Err(HalError::I2cConfig(format!(
                "bus {} does not exist",
                config.bus
            )));
        }
        let key = (config.bus, config.address);
        if !state.open.insert(key) {
            return Err(HalError::BusBusy {
                bus: config.bus,
                address: config.address,
            });
        }
        state.opened_total += 1;
        tracing::debug!("[MOCK] I2C {:?} claimed", key);

        Ok(Box::new(MockI2cBus {
            state: Arc::clone(&self.state),
            key,
        }))
    }
}

struct MockI2cBus {
    state: Arc<RwLock<MockI2cState>>,
    key: (u8, u16),
}

impl I2cBus for MockI2cBus {
    fn write(&mut self, data: &[u8]) -> Result<(), HalError> {
        if let Ok(mut state) = self.state.write() {
            state.written.entry(self.key).or_default().push(data.to_vec());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), HalError> {
        if let Ok(mut state) = self.state.write() {
            let queue = state.reads.entry(self.key).or_default();
            for byte in buf.iter_mut() {
                *byte = queue.pop_front().unwrap_or(0);
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), HalError> {
        if let Ok(mut state) = self.state.write() {
            state.open.remove(&self.key);
        }
        tracing::debug!("[MOCK] I2C {:?} released", self.key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MockReply {
    delay: Duration,
    outcome: HttpOutcome,
}

#[derive(Debug, Default)]
struct MockTransportState {
    replies: HashMap<String, MockReply>,
    default_delay: Duration,
    requests: Vec<HttpRequest>,
}

/// HTTP transport answering from canned replies.
///
/// Unknown URLs get a `200` echoing the request body.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<RwLock<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `response`
    pub fn respond(&self, url: &str, response: HttpResponse) {
        self.reply(url, Duration::ZERO, Ok(response));
    }

    /// Fail exchanges to `url` with `error`
    pub fn fail(&self, url: &str, error: crate::http::HttpError) {
        self.reply(url, Duration::ZERO, Err(error));
    }

    /// Answer `url` after `delay`
    pub fn reply(&self, url: &str, delay: Duration, outcome: HttpOutcome) {
        let key = normalize(url);
        if let Ok(mut state) = self.state.write() {
            state.replies.insert(key, MockReply { delay, outcome });
        }
    }

    /// Delay applied to URLs without a canned reply
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.default_delay = delay;
        }
    }

    /// Requests the transport has seen, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state
            .read()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }
}

fn normalize(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl HttpTransport for MockTransport {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, HttpOutcome> {
        let reply = match self.state.write() {
            Ok(mut state) => {
                state.requests.push(request.clone());
                state
                    .replies
                    .get(request.url.as_str())
                    .cloned()
                    .unwrap_or_else(|| MockReply {
                        delay: state.default_delay,
                        outcome: Ok(HttpResponse::new(200, request.body.clone())),
                    })
            }
            Err(_) => MockReply {
                delay: Duration::ZERO,
                outcome: Err(crate::http::HttpError::Other("mock state poisoned".into())),
            },
        };

        Box::pin(async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            reply.outcome
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct MockPin {
    mode: PinMode,
    pull: Pull,
    level: bool,
}

/// In-memory GPIO driver
#[derive(Clone, Default)]
pub struct MockGpio {
    pins: Arc<RwLock<HashMap<u32, MockPin>>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u32) -> Option<bool> {
        self.pins.read().ok()?.get(&pin).map(|p| p.level)
    }

    pub fn mode(&self, pin: u32) -> Option<PinMode> {
        self.pins.read().ok()?.get(&pin).map(|p| p.mode)
    }

    pub fn pull(&self, pin: u32) -> Option<Pull> {
        self.pins.read().ok()?.get(&pin).map(|p| p.pull)
    }

    /// Simulate an external signal on an input pin
    pub fn drive(&self, pin: u32, level: bool) {
        if let Ok(mut pins) = self.pins.write() {
            if let Some(p) = pins.get_mut(&pin) {
                p.level = level;
            }
        }
    }

    fn with_pin<T>(
        &self,
        pin: u32,
        f: impl FnOnce(&mut MockPin) -> Result<T, HalError>,
    ) -> Result<T, HalError> {
        let mut pins = self
            .pins
            .write()
            .map_err(|_| HalError::Io(std::io::Error::other("mock state poisoned")))?;
        match pins.get_mut(&pin) {
            Some(p) => f(p),
            None => Err(HalError::Io(std::io::Error::other(format!(
                "pin {} not configured",
                pin
            )))),
        }
    }
}

impl GpioDriver for MockGpio {
    fn set_mode(&mut self, pin: u32, mode: PinMode, pull: Pull) -> Result<(), HalError> {
        let mut pins = self
            .pins
            .write()
            .map_err(|_| HalError::Io(std::io::Error::other("mock state poisoned")))?;
        let level = pull == Pull::Up;
        pins.insert(pin, MockPin { mode, pull, level });
        tracing::debug!("[MOCK] GPIO {} set to {:?} ({:?})", pin, mode, pull);
        Ok(())
    }

    fn read(&mut self, pin: u32) -> Result<bool, HalError> {
        self.with_pin(pin, |p| Ok(p.level))
    }

    fn write(&mut self, pin: u32, level: bool) -> Result<(), HalError> {
        self.with_pin(pin, |p| match p.mode {
            PinMode::Output => {
                p.level = level;
                Ok(())
            }
            PinMode::Input => Err(HalError::Io(std::io::Error::other(format!(
                "pin {} is an input",
                pin
            )))),
        })
    }

    fn toggle(&mut self, pin: u32) -> Result<bool, HalError> {
        let level = !self.read(pin)?;
        self.write(pin, level)?;
        Ok(level)
    }
}

/// Mock backends with handles kept for inspection
#[derive(Clone)]
pub struct MockBackends {
    pub system: MockSystem,
    pub i2c: MockI2cBackend,
    pub http: MockTransport,
}

impl MockBackends {
    /// Mock platform with I2C buses 0 and 1
    pub fn new() -> Self {
        Self {
            system: MockSystem::new(),
            i2c: MockI2cBackend::new(&[0, 1]),
            http: MockTransport::new(),
        }
    }

    /// Backends sharing state with these handles
    pub fn backends(&self) -> Backends {
        Backends {
            system: Box::new(self.system.clone()),
            i2c: Box::new(self.i2c.clone()),
            http: Arc::new(self.http.clone()),
        }
    }
}

impl Default for MockBackends {
    fn default() -> Self {
        Self::new()
    }
}

//! Integration tests for the HAL facade and callback dispatch

use futures_util::future::BoxFuture;
use scripthal::mock::{MockBackends, MockEngine, MockGpio};
use scripthal::{
    Backends, CallbackSource, Hal, HalError, HttpError, HttpOutcome, HttpRequest, HttpResponse,
    HttpTransport, NativeValue, ReqwestTransport,
};
use scripthal_config::{Capabilities, HalConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Test environment wiring a HAL to mock backends
struct HalTestEnv {
    mocks: MockBackends,
    engine: MockEngine,
    hal: Hal<MockEngine>,
}

impl HalTestEnv {
    fn new() -> Self {
        Self::with_config(HalConfig::default())
    }

    fn with_config(config: HalConfig) -> Self {
        let mocks = MockBackends::new();
        let hal = Hal::new(&config, mocks.backends(), Handle::current());
        Self {
            mocks,
            engine: MockEngine::new(),
            hal,
        }
    }
}

fn i2c_args(bus: f64, address: f64) -> NativeValue {
    NativeValue::object([
        ("bus", NativeValue::Number(bus)),
        ("address", NativeValue::Number(address)),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_timers_fire_by_deadline() {
    let mut env = HalTestEnv::new();
    let a = env.engine.function("a");
    let b = env.engine.function("b");

    env.hal.schedule_timeout(&mut env.engine, 100, &a).unwrap();
    env.hal.schedule_timeout(&mut env.engine, 50, &b).unwrap();
    env.hal.run_until_idle(&mut env.engine).await;

    assert_eq!(env.engine.invocation_order(), vec!["b", "a"]);
    assert_eq!(env.engine.invocations("a").len(), 1);
    assert_eq!(env.engine.invocations("b").len(), 1);
    assert_eq!(env.engine.retained_count(), 0);
    assert!(env.hal.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_equal_delays_fire_in_registration_order() {
    let mut env = HalTestEnv::new();
    for label in ["first", "second", "third"] {
        let f = env.engine.function(label);
        env.hal.schedule_timeout(&mut env.engine, 0, &f).unwrap();
    }

    env.hal.run_until_idle(&mut env.engine).await;

    assert_eq!(
        env.engine.invocation_order(),
        vec!["first", "second", "third"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_timer_waits_for_its_delay() {
    let mut env = HalTestEnv::new();
    let f = env.engine.function("later");
    env.hal.schedule_timeout(&mut env.engine, 100, &f).unwrap();

    assert_eq!(env.hal.dispatch(&mut env.engine), 0);
    tokio::time::advance(Duration::from_millis(99)).await;
    assert_eq!(env.hal.dispatch(&mut env.engine), 0);
    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(env.hal.dispatch(&mut env.engine), 1);
    assert_eq!(env.hal.dispatch(&mut env.engine), 0);

    assert_eq!(env.engine.invocations("later").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ready_callbacks_can_be_fired_by_the_host() {
    let mut env = HalTestEnv::new();
    let f = env.engine.function("tick");
    let id = env.hal.schedule_timeout(&mut env.engine, 5, &f).unwrap();

    tokio::time::advance(Duration::from_millis(5)).await;
    let ready = env.hal.take_ready();
    assert_eq!(ready.len(), 1);
    assert!(env.hal.is_idle());

    for callback in ready {
        assert_eq!(callback.source(), CallbackSource::Timer(id));
        assert!(callback.payload().is_none());
        callback.fire(&mut env.engine).unwrap();
    }
    assert_eq!(env.engine.invocations("tick"), vec![Vec::<NativeValue>::new()]);
}

#[tokio::test(start_paused = true)]
async fn test_raising_callback_does_not_stop_dispatch() {
    let mut env = HalTestEnv::new();
    let bad = env.engine.throwing_function("bad");
    let good = env.engine.function("good");
    env.hal.schedule_timeout(&mut env.engine, 10, &bad).unwrap();
    env.hal.schedule_timeout(&mut env.engine, 10, &good).unwrap();

    env.hal.run_until_idle(&mut env.engine).await;

    assert_eq!(env.engine.invocation_order(), vec!["bad", "good"]);
    assert_eq!(env.engine.retained_count(), 0);
}

#[tokio::test]
async fn test_timer_capacity_from_config() {
    let mut config = HalConfig::default();
    config.timers.max_pending = 1;
    let mut env = HalTestEnv::with_config(config);
    let f = env.engine.function("cb");

    env.hal.schedule_timeout(&mut env.engine, 1000, &f).unwrap();
    let err = env
        .hal
        .schedule_timeout(&mut env.engine, 1000, &f)
        .unwrap_err();
    assert!(matches!(err, HalError::TimerCapacity { limit: 1 }));

    let report = env.hal.teardown(&mut env.engine);
    assert_eq!(report.timers_released, 1);
    assert_eq!(env.engine.retained_count(), 0);
}

#[tokio::test]
async fn test_non_callable_timer_is_rejected() {
    let mut env = HalTestEnv::new();
    let data = MockEngine::data(NativeValue::Number(1.0));

    assert!(matches!(
        env.hal.schedule_timeout(&mut env.engine, 10, &data),
        Err(HalError::NotCallable)
    ));
    assert!(env.hal.is_idle());
}

#[tokio::test]
async fn test_bad_url_callback_is_never_invoked() {
    let mut env = HalTestEnv::new();
    let cb = env.engine.function("cb");

    let err = env
        .hal
        .http_call(&mut env.engine, "http://bad..url", b"", "GET", &cb)
        .unwrap_err();
    assert!(matches!(err, HalError::InvalidUrl(_)));

    env.hal.run_until_idle(&mut env.engine).await;
    assert!(env.engine.invocations("cb").is_empty());
    assert_eq!(env.engine.retained_count(), 0);
    assert!(env.mocks.http.requests().is_empty());
}

#[tokio::test]
async fn test_http_success_invokes_callback_once() {
    let mut env = HalTestEnv::new();
    env.mocks.http.respond(
        "http://sensor.local/reading",
        HttpResponse::new(200, "21.5"),
    );
    let cb = env.engine.function("cb");

    env.hal
        .http_call(&mut env.engine, "http://sensor.local/reading", b"", "", &cb)
        .unwrap();
    assert_eq!(env.hal.requests_in_flight(), 1);
    env.hal.run_until_idle(&mut env.engine).await;

    let calls = env.engine.invocations("cb");
    assert_eq!(calls.len(), 1);
    let payload = &calls[0][0];
    assert_eq!(payload.get("ok"), Some(&NativeValue::Bool(true)));
    assert_eq!(payload.get("status"), Some(&NativeValue::Number(200.0)));
    assert_eq!(
        payload.get("body"),
        Some(&NativeValue::Bytes(b"21.5".to_vec()))
    );

    let requests = env.mocks.http.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method.as_str(), "GET");
    assert_eq!(env.engine.retained_count(), 0);
    assert_eq!(env.hal.requests_in_flight(), 0);
}

#[tokio::test]
async fn test_http_failure_invokes_callback_once() {
    let mut env = HalTestEnv::new();
    env.mocks.http.fail(
        "http://offline.local/",
        HttpError::Connect("connection refused".into()),
    );
    let cb = env.engine.function("cb");

    env.hal
        .http_call(&mut env.engine, "http://offline.local/", b"x", "POST", &cb)
        .unwrap();
    env.hal.run_until_idle(&mut env.engine).await;

    let calls = env.engine.invocations("cb");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].get("ok"), Some(&NativeValue::Bool(false)));
    assert!(calls[0][0].get("error").is_some());
    assert_eq!(env.engine.retained_count(), 0);
}

#[tokio::test]
async fn test_unreachable_host_reports_failure() {
    let config = HalConfig::default();
    let mocks = MockBackends::new();
    let backends = Backends {
        system: Box::new(mocks.system.clone()),
        i2c: Box::new(mocks.i2c.clone()),
        http: Arc::new(ReqwestTransport::new(&config.http).unwrap()),
    };
    let mut hal: Hal<MockEngine> = Hal::new(&config, backends, Handle::current());
    let mut engine = MockEngine::new();
    let cb = engine.function("cb");

    hal.http_call(&mut engine, "http://127.0.0.1:1/", b"", "GET", &cb)
        .unwrap();
    hal.run_until_idle(&mut engine).await;

    let calls = engine.invocations("cb");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].get("ok"), Some(&NativeValue::Bool(false)));
}

/// Transport whose exchanges blow up instead of returning
struct PanickingTransport;

impl HttpTransport for PanickingTransport {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, HttpOutcome> {
        if request.url.path() == "/sync" {
            panic!("transport failed before returning a future");
        }
        Box::pin(exploding_exchange())
    }
}

async fn exploding_exchange() -> HttpOutcome {
    panic!("transport failed mid-exchange")
}

#[tokio::test]
async fn test_panicking_transport_still_completes_callbacks() {
    let config = HalConfig::default();
    let mocks = MockBackends::new();
    let backends = Backends {
        system: Box::new(mocks.system.clone()),
        i2c: Box::new(mocks.i2c.clone()),
        http: Arc::new(PanickingTransport),
    };
    let mut hal: Hal<MockEngine> = Hal::new(&config, backends, Handle::current());
    let mut engine = MockEngine::new();
    let early = engine.function("early");
    let late = engine.function("late");

    hal.http_call(&mut engine, "http://device.local/sync", b"", "GET", &early)
        .unwrap();
    hal.http_call(&mut engine, "http://device.local/async", b"", "GET", &late)
        .unwrap();

    let finished =
        tokio::time::timeout(Duration::from_secs(5), hal.run_until_idle(&mut engine)).await;
    assert!(finished.is_ok(), "run loop did not go idle");

    for label in ["early", "late"] {
        let calls = engine.invocations(label);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].get("ok"), Some(&NativeValue::Bool(false)));
        assert_eq!(
            calls[0][0].get("error"),
            Some(&NativeValue::String(
                "HTTP exchange failed: transport panicked".into()
            ))
        );
    }
    assert_eq!(engine.retained_count(), 0);
    assert_eq!(hal.requests_in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_complete_in_completion_order() {
    let mut env = HalTestEnv::new();
    env.mocks.http.reply(
        "http://slow.local/",
        Duration::from_millis(100),
        Ok(HttpResponse::new(200, "slow")),
    );
    env.mocks.http.reply(
        "http://fast.local/",
        Duration::from_millis(10),
        Ok(HttpResponse::new(200, "fast")),
    );
    let slow = env.engine.function("slow");
    let fast = env.engine.function("fast");

    env.hal
        .http_call(&mut env.engine, "http://slow.local/", b"", "GET", &slow)
        .unwrap();
    env.hal
        .http_call(&mut env.engine, "http://fast.local/", b"", "GET", &fast)
        .unwrap();
    assert_eq!(env.hal.requests_in_flight(), 2);
    env.hal.run_until_idle(&mut env.engine).await;

    assert_eq!(env.engine.invocation_order(), vec!["fast", "slow"]);
    assert_eq!(
        env.engine.invocations("slow")[0][0].get("body"),
        Some(&NativeValue::Bytes(b"slow".to_vec()))
    );
    assert_eq!(
        env.engine.invocations("fast")[0][0].get("body"),
        Some(&NativeValue::Bytes(b"fast".to_vec()))
    );
    assert_eq!(env.engine.retained_count(), 0);
}

#[tokio::test]
async fn test_mixed_sources_dispatch_timers_first() {
    let mut env = HalTestEnv::new();
    let http_cb = env.engine.function("http");
    let timer_cb = env.engine.function("timer");

    env.hal
        .http_call(&mut env.engine, "http://device.local/", b"", "GET", &http_cb)
        .unwrap();
    env.hal
        .schedule_timeout(&mut env.engine, 0, &timer_cb)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    env.hal.run_until_idle(&mut env.engine).await;

    assert_eq!(env.engine.invocations("timer").len(), 1);
    assert_eq!(env.engine.invocations("http").len(), 1);
    assert_eq!(env.engine.invocation_order()[0], "timer");
}

#[tokio::test]
async fn test_i2c_open_close_reopen() {
    let mut env = HalTestEnv::new();
    let args = MockEngine::data(i2c_args(1.0, 0x3c as f64));

    let id = env.hal.i2c_open(&env.engine, &args).unwrap();
    assert_eq!(env.mocks.i2c.open_sessions(), 1);

    env.hal.i2c().write(id, &[0xae]).unwrap();
    assert_eq!(env.mocks.i2c.written(1, 0x3c), vec![vec![0xae]]);

    env.hal.i2c_close(id).unwrap();
    assert_eq!(env.mocks.i2c.open_sessions(), 0);
    assert!(matches!(
        env.hal.i2c_close(id),
        Err(HalError::AlreadyClosed(_))
    ));

    let again = env.hal.i2c_open(&env.engine, &args).unwrap();
    env.hal.i2c_close(again).unwrap();
    assert_eq!(env.mocks.i2c.opened_total(), 2);
}

#[tokio::test]
async fn test_i2c_invalid_config_opens_nothing() {
    let mut env = HalTestEnv::new();

    let bad_address = MockEngine::data(i2c_args(0.0, 0x02 as f64));
    assert!(matches!(
        env.hal.i2c_open(&env.engine, &bad_address),
        Err(HalError::I2cConfig(_))
    ));

    let not_data = env.engine.function("f");
    assert!(env.hal.i2c_open(&env.engine, &not_data).is_err());

    let missing_bus = MockEngine::data(i2c_args(9.0, 0x3c as f64));
    assert!(env.hal.i2c_open(&env.engine, &missing_bus).is_err());

    assert_eq!(env.mocks.i2c.opened_total(), 0);
}

#[tokio::test]
async fn test_teardown_releases_without_invoking() {
    let mut env = HalTestEnv::new();
    env.mocks.http.set_delay(Duration::from_secs(3600));
    let timer_cb = env.engine.function("timer");
    let http_cb = env.engine.function("http");

    env.hal
        .schedule_timeout(&mut env.engine, 60_000, &timer_cb)
        .unwrap();
    env.hal
        .http_call(&mut env.engine, "http://slow.local/", b"", "GET", &http_cb)
        .unwrap();
    let args = MockEngine::data(i2c_args(0.0, 0x50 as f64));
    env.hal.i2c_open(&env.engine, &args).unwrap();
    assert_eq!(env.engine.retained_count(), 2);

    let HalTestEnv {
        mocks,
        mut engine,
        hal,
    } = env;
    let report = hal.teardown(&mut engine);

    assert_eq!(report.timers_released, 1);
    assert_eq!(report.requests_abandoned, 1);
    assert_eq!(report.connections_closed, 1);
    assert!(engine.invocation_order().is_empty());
    assert_eq!(engine.retained_count(), 0);
    assert_eq!(engine.over_released(), 0);
    assert_eq!(mocks.i2c.open_sessions(), 0);
}

#[tokio::test]
async fn test_system_primitives_reach_backend() {
    let mut env = HalTestEnv::new();
    {
        let state = env.mocks.system.state();
        let mut state = state.write().unwrap();
        state.heap_free = 4096;
        state.fs_used = 8192;
    }

    assert_eq!(env.hal.heap_free_bytes().unwrap(), 4096);
    assert_eq!(env.hal.fs_usage_bytes().unwrap(), 8192);

    env.hal.feed_watchdog().unwrap();
    env.hal.feed_watchdog().unwrap();
    env.hal.sleep_microseconds(250);
    env.hal.restart_system().unwrap();

    let state = env.mocks.system.state();
    let state = state.read().unwrap();
    assert_eq!(state.watchdog_feeds, 2);
    assert_eq!(state.slept_us, 250);
    assert_eq!(state.restarts, 1);
}

#[tokio::test]
async fn test_gpio_bindings_follow_capabilities() {
    let mut config = HalConfig::default();
    config.capabilities = Capabilities {
        scripting: true,
        gpio_api: false,
    };
    let mut env = HalTestEnv::with_config(config);
    let registered = env
        .hal
        .setup_gpio_bindings(&mut env.engine, Box::new(MockGpio::new()))
        .unwrap();
    assert!(!registered);
    assert!(env.engine.registered_functions().is_empty());

    let mut config = HalConfig::default();
    config.capabilities = Capabilities {
        scripting: true,
        gpio_api: true,
    };
    let mut env = HalTestEnv::with_config(config);
    let gpio = MockGpio::new();
    let registered = env
        .hal
        .setup_gpio_bindings(&mut env.engine, Box::new(gpio.clone()))
        .unwrap();
    assert!(registered);

    env.engine
        .call(
            "GPIO.setMode",
            vec![NativeValue::Number(17.0), NativeValue::Number(1.0)],
        )
        .unwrap();
    env.engine
        .call(
            "GPIO.write",
            vec![NativeValue::Number(17.0), NativeValue::Bool(true)],
        )
        .unwrap();
    assert_eq!(gpio.level(17), Some(true));
}

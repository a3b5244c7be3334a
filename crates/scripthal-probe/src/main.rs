//! scripthal probe
//!
//! Drives the HAL on a real device without a script engine attached.
//! Callbacks are stand-ins that print their payload as JSON.
//!
//! Usage:
//!   scripthal-probe [--config PATH] <command>
//!
//! Commands:
//!   info                          heap, filesystem and capability report
//!   watchdog                      feed the hardware watchdog once
//!   sleep <us>                    blocking delay
//!   timeout <ms>                  schedule a timer and wait for it
//!   http <METHOD> <URL> [BODY]    perform a request and print the result
//!   i2c <bus> <address>           open and close an I2C connection
//!   restart --yes                 restart the device

use anyhow::{Context, Result, bail};
use scripthal::{EngineError, Hal, NativeFunction, NativeValue, ScriptEngine};
use scripthal_config::HalConfig;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Info,
    Watchdog,
    Sleep(u64),
    Timeout(u64),
    Http {
        method: String,
        url: String,
        body: String,
    },
    I2c {
        bus: u8,
        address: u16,
    },
    Restart,
}

#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

/// Values seen by the console engine
#[derive(Debug, Clone)]
enum ConsoleValue {
    Data(NativeValue),
    Callback(&'static str),
}

/// Engine stand-in that prints every callback invocation
#[derive(Default)]
struct ConsoleEngine {
    retained: usize,
    invoked: usize,
}

impl ScriptEngine for ConsoleEngine {
    type Value = ConsoleValue;

    fn is_callable(&self, value: &ConsoleValue) -> bool {
        matches!(value, ConsoleValue::Callback(_))
    }

    fn retain(&mut self, _value: &ConsoleValue) {
        self.retained += 1;
    }

    fn release(&mut self, _value: &ConsoleValue) {
        self.retained = self.retained.saturating_sub(1);
    }

    fn invoke(&mut self, callback: &ConsoleValue, args: Vec<ConsoleValue>) -> Result<(), EngineError> {
        let ConsoleValue::Callback(name) = callback else {
            return Err(EngineError::NotCallable);
        };
        self.invoked += 1;

        let payload: Vec<NativeValue> = args.iter().filter_map(|a| self.to_native(a)).collect();
        let json = serde_json::to_string_pretty(&payload)
            .map_err(|e| EngineError::Exception(e.to_string()))?;
        println!("{} fired with {}", name, json);
        Ok(())
    }

    fn to_value(&mut self, native: NativeValue) -> ConsoleValue {
        ConsoleValue::Data(native)
    }

    fn to_native(&self, value: &ConsoleValue) -> Option<NativeValue> {
        match value {
            ConsoleValue::Data(native) => Some(native.clone()),
            ConsoleValue::Callback(_) => None,
        }
    }

    fn register_function(
        &mut self,
        namespace: &str,
        name: &str,
        _function: NativeFunction<Self>,
    ) -> Result<(), EngineError> {
        debug!("Ignoring registration of {}.{}", namespace, name);
        Ok(())
    }
}

fn main() -> Result<()> {
    setup_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    let config = HalConfig::load_layered(invocation.config.as_deref())
        .context("Failed to load HAL configuration")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(invocation.command, config))
}

/// Setup logging to stderr so stdout stays parseable
fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(command: Command, config: HalConfig) -> Result<()> {
    let mut engine = ConsoleEngine::default();
    let mut hal: Hal<ConsoleEngine> = Hal::linux(&config)?;

    match command {
        Command::Info => print_info(&hal)?,

        Command::Watchdog => {
            hal.feed_watchdog().context("Failed to feed watchdog")?;
            println!("watchdog fed");
        }

        Command::Sleep(us) => {
            let start = Instant::now();
            hal.sleep_microseconds(us);
            println!("slept {:?}", start.elapsed());
        }

        Command::Timeout(ms) => {
            let start = Instant::now();
            hal.schedule_timeout(&mut engine, ms, &ConsoleValue::Callback("timeout"))?;
            hal.run_until_idle(&mut engine).await;
            info!("Timer fired after {:?}", start.elapsed());
        }

        Command::Http { method, url, body } => {
            hal.http_call(
                &mut engine,
                &url,
                body.as_bytes(),
                &method,
                &ConsoleValue::Callback("http"),
            )
            .with_context(|| format!("Failed to start {} {}", method, url))?;
            hal.run_until_idle(&mut engine).await;
        }

        Command::I2c { bus, address } => {
            let args = ConsoleValue::Data(NativeValue::object([
                ("bus", NativeValue::from(u32::from(bus))),
                ("address", NativeValue::from(u32::from(address))),
            ]));
            let id = hal.i2c_open(&engine, &args)?;
            println!("opened connection {} on bus {} address {:#04x}", id.as_u64(), bus, address);
            hal.i2c_close(id)?;
            println!("closed connection {}", id.as_u64());
        }

        Command::Restart => {
            warn!("Restarting device");
            hal.restart_system().context("Restart failed")?;
        }
    }

    let report = hal.teardown(&mut engine);
    debug!(
        "Probe done: {} callbacks fired, {} references held, {:?}",
        engine.invoked, engine.retained, report
    );
    Ok(())
}

fn print_info(hal: &Hal<ConsoleEngine>) -> Result<()> {
    let capabilities = hal.capabilities();
    let report = NativeValue::object([
        ("heap_free_bytes", NativeValue::Number(hal.heap_free_bytes()? as f64)),
        ("fs_used_bytes", NativeValue::Number(hal.fs_usage_bytes()? as f64)),
        ("scripting", NativeValue::Bool(capabilities.scripting)),
        ("gpio_api", NativeValue::Bool(capabilities.gpio_api)),
        (
            "gpio_bindings",
            NativeValue::Bool(capabilities.gpio_bindings_enabled()),
        ),
    ]);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = None;
    let mut rest = args;

    if let [flag, path, tail @ ..] = rest {
        if flag == "--config" {
            config = Some(PathBuf::from(path));
            rest = tail;
        }
    }

    let words: Vec<&str> = rest.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        ["info"] => Command::Info,
        ["watchdog"] => Command::Watchdog,
        ["sleep", us] => Command::Sleep(us.parse().context("sleep takes microseconds")?),
        ["timeout", ms] => Command::Timeout(ms.parse().context("timeout takes milliseconds")?),
        ["http", method, url] => Command::Http {
            method: method.to_string(),
            url: url.to_string(),
            body: String::new(),
        },
        ["http", method, url, body] => Command::Http {
            method: method.to_string(),
            url: url.to_string(),
            body: body.to_string(),
        },
        ["i2c", bus, address] => Command::I2c {
            bus: bus.parse().context("Invalid I2C bus")?,
            address: parse_address(address)?,
        },
        ["restart", "--yes"] => Command::Restart,
        ["restart"] => bail!("restart requires --yes"),
        [] => bail!("No command given\n{}", usage()),
        other => bail!("Unknown command: {}\n{}", other.join(" "), usage()),
    };

    Ok(Invocation { config, command })
}

/// Accepts decimal or `0x` hex
fn parse_address(raw: &str) -> Result<u16> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("Invalid I2C address: {}", raw))
}

fn usage() -> &'static str {
    "usage: scripthal-probe [--config PATH] <info|watchdog|sleep US|timeout MS|http METHOD URL [BODY]|i2c BUS ADDR|restart --yes>"
}

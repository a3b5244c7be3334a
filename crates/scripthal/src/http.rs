//! HTTP client bridge
//!
//! `call` either fails synchronously (bad URL, bad method, too many requests
//! in flight) without touching the callback, or starts the exchange and
//! guarantees the callback receives exactly one outcome later. Callers tell
//! "never started" from "started but failed" by which of the two happened.

use crate::callback::Callback;
use crate::engine::{NativeValue, ScriptEngine};
use crate::HalError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::{Method, Url};
use scripthal_config::HttpConfig;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Failure of an exchange that had already started
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HttpError {
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP exchange failed: {0}")]
    Other(String),
}

impl HttpError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return HttpError::Timeout;
        }

        let mut chain = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }

        if chain.contains("dns error") {
            HttpError::Dns(chain)
        } else if err.is_connect() {
            HttpError::Connect(chain)
        } else {
            HttpError::Other(chain)
        }
    }
}

/// Identifier of an initiated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Validated request handed to a transport
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: Method,
    /// Length-delimited payload, may contain arbitrary bytes
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Outcome delivered to a request's callback
pub type HttpOutcome = Result<HttpResponse, HttpError>;

/// Performs the network exchange for the bridge
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, HttpOutcome>;
}

/// Production transport backed by a shared reqwest client
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, HalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HalError::HttpClient(e.to_string()))?;

        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, HttpOutcome> {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .request(request.method, request.url)
                .body(request.body)
                .send()
                .await
                .map_err(HttpError::from_reqwest)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(HttpError::from_reqwest)?
                .to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

struct InFlight<V> {
    callback: Callback<V>,
    task: JoinHandle<()>,
}

/// Completed exchange waiting for the next dispatch tick
pub type Completion = (RequestId, HttpOutcome);

/// Tracks in-flight requests and their callbacks
pub struct HttpBridge<V> {
    transport: Arc<dyn HttpTransport>,
    runtime: Handle,
    in_flight: HashMap<RequestId, InFlight<V>>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    ready: VecDeque<Completion>,
    next_id: u64,
    max_in_flight: usize,
}

impl<V: Clone> HttpBridge<V> {
    pub fn new(transport: Arc<dyn HttpTransport>, runtime: Handle, max_in_flight: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            runtime,
            in_flight: HashMap::new(),
            tx,
            rx,
            ready: VecDeque::new(),
            next_id: 0,
            max_in_flight,
        }
    }

    /// Initiate a request.
    ///
    /// An `Err` means the request never started and `callback` will never be
    /// invoked. `Ok` means `callback` will be invoked exactly once with the
    /// outcome, unless the bridge is torn down first.
    pub fn call<E>(
        &mut self,
        engine: &mut E,
        url: &str,
        body: &[u8],
        method: &str,
        callback: &V,
    ) -> Result<RequestId, HalError>
    where
        E: ScriptEngine<Value = V>,
    {
        let url = parse_url(url)?;
        let method = parse_method(method)?;

        if self.in_flight.len() >= self.max_in_flight {
            return Err(HalError::HttpCapacity {
                limit: self.max_in_flight,
            });
        }

        let callback = Callback::retain(engine, callback)?;
        let id = RequestId(self.next_id);
        self.next_id += 1;

        tracing::debug!(
            "HTTP request {} started: {} {} ({} bytes)",
            id.0,
            method,
            url,
            body.len()
        );

        let request = HttpRequest {
            url,
            method,
            body: body.to_vec(),
        };
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            let exchange = AssertUnwindSafe(async move { transport.execute(request).await });
            let outcome = exchange.catch_unwind().await.unwrap_or_else(|_| {
                tracing::error!("HTTP request {} transport panicked", id.0);
                Err(HttpError::Other("transport panicked".into()))
            });
            // The receiver only disappears with the bridge itself
            let _ = tx.send((id, outcome));
        });

        self.in_flight.insert(id, InFlight { callback, task });
        Ok(id)
    }

    /// Wait for the next completed exchange
    pub async fn recv_completion(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Queue a completion received through [`recv_completion`](Self::recv_completion)
    pub fn push_ready(&mut self, completion: Completion) {
        self.ready.push_back(completion);
    }

    /// Every completed exchange with its callback, in completion order
    pub fn take_completed(&mut self) -> Vec<(RequestId, Callback<V>, HttpOutcome)> {
        while let Ok(completion) = self.rx.try_recv() {
            self.ready.push_back(completion);
        }

        let mut completed = Vec::with_capacity(self.ready.len());
        while let Some((id, outcome)) = self.ready.pop_front() {
            if let Some(entry) = self.in_flight.remove(&id) {
                completed.push((id, entry.callback, outcome));
            }
        }
        completed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Abort every in-flight exchange and release its callback uninvoked
    pub fn abandon_all<E>(&mut self, engine: &mut E) -> usize
    where
        E: ScriptEngine<Value = V>,
    {
        let abandoned = self.in_flight.len();
        for (id, entry) in self.in_flight.drain() {
            entry.task.abort();
            entry.callback.release(engine);
            tracing::debug!("HTTP request {} abandoned", id.0);
        }
        self.ready.clear();
        while self.rx.try_recv().is_ok() {}
        abandoned
    }
}

/// Convert an outcome into the single argument passed to the callback
pub fn outcome_to_native(outcome: HttpOutcome) -> NativeValue {
    match outcome {
        Ok(response) => {
            let mut merged: BTreeMap<String, String> = BTreeMap::new();
            for (name, value) in response.headers {
                match merged.get_mut(&name) {
                    Some(existing) => {
                        existing.push_str(", ");
                        existing.push_str(&value);
                    }
                    None => {
                        merged.insert(name, value);
                    }
                }
            }
            let headers = NativeValue::object(
                merged
                    .into_iter()
                    .map(|(name, value)| (name, NativeValue::String(value))),
            );
            NativeValue::object([
                ("ok", NativeValue::Bool(true)),
                ("status", NativeValue::Number(response.status.into())),
                ("headers", headers),
                ("body", NativeValue::Bytes(response.body)),
            ])
        }
        Err(err) => NativeValue::object([
            ("ok", NativeValue::Bool(false)),
            ("error", NativeValue::String(err.to_string())),
        ]),
    }
}

/// Validate a script-supplied URL before anything is started
pub fn parse_url(raw: &str) -> Result<Url, HalError> {
    let url = Url::parse(raw).map_err(|e| HalError::InvalidUrl(format!("{}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(HalError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw,
            url.scheme()
        )));
    }

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(HalError::InvalidUrl(format!("{}: missing host", raw))),
    };

    let is_ip = host.starts_with('[') || host.parse::<IpAddr>().is_ok();
    if !is_ip && host.split('.').any(str::is_empty) {
        return Err(HalError::InvalidUrl(format!("{}: empty host label", raw)));
    }

    Ok(url)
}

/// Parse a method name, defaulting to GET when empty
pub fn parse_method(raw: &str) -> Result<Method, HalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Method::GET);
    }
    Method::from_bytes(trimmed.to_ascii_uppercase().as_bytes())
        .map_err(|_| HalError::InvalidMethod(raw.to_string()))
}

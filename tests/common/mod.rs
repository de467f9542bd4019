//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crypto_relay::clock::ManualClock;
use crypto_relay::config::{QuotaConfig, RelayConfig, ServiceConfig};
use crypto_relay::error::UpstreamFailure;
use crypto_relay::gateway::{Gateway, Upstream, UpstreamResponse};
use crypto_relay::pool::Connection;
use crypto_relay::store::MemoryStore;

/// What a scripted upstream does for one call.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(Value),
    Status(u16),
    Hang,
}

/// Upstream that replays a script, then repeats a default outcome.
#[derive(Debug)]
pub struct ScriptedUpstream {
    calls: AtomicU32,
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedUpstream {
    pub fn new(script: Vec<Outcome>, default: Outcome) -> Self {
        Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(script.into()),
            default,
            gate: None,
        }
    }

    pub fn always(outcome: Outcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    /// Each call waits for a permit on `gate` before answering.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn call(
        &self,
        _connection: &Connection,
        service: &ServiceConfig,
        _operation: &str,
        _payload: &Value,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        match outcome {
            Outcome::Ok(body) => Ok(UpstreamResponse::new(body)),
            Outcome::Status(status) => Err(UpstreamFailure::Status {
                status,
                body: format!("{} unavailable", service.name),
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

pub fn service(name: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        base_url: format!("http://{}.test", name),
        ..ServiceConfig::default()
    }
}

/// Config tuned for fast, deterministic tests.
pub fn test_config(services: Vec<ServiceConfig>, quotas: Vec<QuotaConfig>) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.services = services;
    config.quotas = quotas;
    config.breaker.failure_threshold = 3;
    config.breaker.recovery_timeout_ms = 1_000;
    config.breaker.half_open_limit = 1;
    config.pool.limit = 4;
    config.pool.limit_per_host = 4;
    config.pool.acquire_timeout_ms = 100;
    config.timeouts.request_secs = 1;
    config.retries.base_delay_ms = 1;
    config.retries.max_delay_ms = 5;
    config.observability.metrics_enabled = false;
    config
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub upstream: Arc<ScriptedUpstream>,
    pub store: MemoryStore,
    pub clock: ManualClock,
}

pub fn harness(config: &RelayConfig, upstream: ScriptedUpstream) -> Harness {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = MemoryStore::with_clock(Arc::new(clock.clone()));
    let upstream = Arc::new(upstream);
    let gateway = gateway_on(config, &store, &clock, upstream.clone());
    Harness {
        gateway,
        upstream,
        store,
        clock,
    }
}

/// Another instance attached to the same store.
pub fn gateway_on(
    config: &RelayConfig,
    store: &MemoryStore,
    clock: &ManualClock,
    upstream: Arc<dyn Upstream>,
) -> Arc<Gateway> {
    Arc::new(
        Gateway::from_config(
            config,
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            upstream,
        )
        .unwrap(),
    )
}

pub fn price(id: &str) -> Value {
    json!({ "ids": id, "vs_currencies": "usd" })
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// A request as seen by the mock backend.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: String,
}

/// Start a programmable HTTP backend on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(SeenRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(seen) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, body) = f(seen).await;
                        let status_text = match status {
                            200 => "200 OK",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&buf[head_end..]).to_string();
    Some(SeenRequest { head, body })
}

//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use traffic_replay::emitter::ExchangeSink;
use traffic_replay::error::{OutputError, ReplayError};
use traffic_replay::input::Input;
use traffic_replay::lifecycle::ShutdownSignal;
use traffic_replay::output::Output;
use traffic_replay::protocol::{CorrelatedExchange, Direction, Message, MessageId, StreamId};

/// Request-only exchange `<method> <path>` at `offset_ns`.
pub fn request(stream: u64, seq: u64, method: &str, path: &str, offset_ns: u64) -> CorrelatedExchange {
    let id = MessageId::new(StreamId::from_raw(stream), seq);
    let payload = Bytes::from(format!("{method} {path} HTTP/1.1\r\nHost: example\r\n\r\n"));
    CorrelatedExchange::new(Message::new(id, Direction::Request, payload, offset_ns))
}

/// Exchange `<method> <path>` answered with `status`.
pub fn exchange(stream: u64, seq: u64, method: &str, path: &str, status: u16) -> CorrelatedExchange {
    let (request, _) = request(stream, seq, method, path, seq * 1_000).into_parts();
    let id = request.id();
    let payload = Bytes::from(format!("HTTP/1.1 {status} X\r\nContent-Length: 0\r\n\r\n"));
    let response = Message::new(id, Direction::Response, payload, seq * 1_000 + 500);
    CorrelatedExchange::matched(request, response)
}

/// Request path of an exchange, for assertions.
pub fn path_of(exchange: &CorrelatedExchange) -> String {
    let payload = String::from_utf8_lossy(exchange.request().payload()).to_string();
    payload.split(' ').nth(1).unwrap_or_default().to_string()
}

/// Input that emits a fixed list of exchanges, then optionally waits for shutdown.
pub struct StaticInput {
    name: String,
    exchanges: Mutex<Vec<CorrelatedExchange>>,
    linger: bool,
}

impl StaticInput {
    pub fn new(name: &str, exchanges: Vec<CorrelatedExchange>) -> Self {
        Self {
            name: name.to_string(),
            exchanges: Mutex::new(exchanges),
            linger: false,
        }
    }

    /// Keep running after the last exchange until shutdown.
    pub fn lingering(mut self) -> Self {
        self.linger = true;
        self
    }
}

#[async_trait]
impl Input for StaticInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "static"
    }

    async fn run(&self, sink: ExchangeSink, mut shutdown: ShutdownSignal) -> Result<(), ReplayError> {
        let exchanges = std::mem::take(&mut *self.exchanges.lock().unwrap());
        for exchange in exchanges {
            sink.emit(exchange).await;
        }
        if self.linger {
            shutdown.recv().await;
        }
        Ok(())
    }
}

/// Output that keeps everything it is sent.
pub struct CollectingOutput {
    name: String,
    delay: Duration,
    seen: Mutex<Vec<CorrelatedExchange>>,
    arrivals: Mutex<Vec<tokio::time::Instant>>,
    failures_left: AtomicU32,
    pub flushed: AtomicBool,
    pub closed: AtomicBool,
}

impl CollectingOutput {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, 0))
    }

    /// Each send takes `delay`.
    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, delay, 0))
    }

    /// The first `failures` sends fail with a retryable error.
    pub fn flaky(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self::build(name, Duration::ZERO, failures))
    }

    fn build(name: &str, delay: Duration, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            delay,
            seen: Mutex::new(Vec::new()),
            arrivals: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(failures),
            flushed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn seen(&self) -> Vec<CorrelatedExchange> {
        self.seen.lock().unwrap().clone()
    }

    /// When each exchange was accepted, in order.
    pub fn arrivals(&self) -> Vec<tokio::time::Instant> {
        self.arrivals.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(path_of).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Output for CollectingOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "collect"
    }

    async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OutputError::Unavailable("injected failure".to_string()));
        }
        self.seen.lock().unwrap().push(exchange.clone());
        self.arrivals.lock().unwrap().push(tokio::time::Instant::now());
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Start a raw HTTP/1.1 backend that answers every request with `status` and
/// `body`, keeping connections alive. Returns its address.
pub async fn start_mock_backend(status: u16, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut pending = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&buf[..n]);
                    // Requests in these tests carry no body.
                    while let Some(end) = find_head_end(&pending) {
                        pending.drain(..end);
                        let response = format!(
                            "HTTP/1.1 {status} X\r\nContent-Length: {}\r\n\r\n{body}",
                            body.len()
                        );
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    addr
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

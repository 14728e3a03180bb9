//! Inline TCP tap.
//!
//! # Responsibilities
//! - Accept client connections and proxy each one to the upstream
//! - Tee both directions into the Input's assembler task
//! - Emit every correlated exchange through the sink
//!
//! # Data Flow
//! ```text
//! client ──► pump ──► upstream          (forwarded first)
//!              │
//!              └─► try_send(CaptureEvent) ──► assembler task ──► sink.emit
//! ```
//!
//! # Design Decisions
//! - Live traffic is never slowed by capture: when the capture channel is
//!   full the stream is marked truncated and no longer teed
//! - One assembler task owns all stream state for this Input
//! - Shutdown closes proxied connections; the assembler flushes what it has

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::Input;
use crate::config::plugin::TapSettings;
use crate::config::schema::CaptureConfig;
use crate::emitter::ExchangeSink;
use crate::error::ReplayError;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::{ConnectionGuard, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::observability::InputStats;
use crate::protocol::{Assembler, AssemblerConfig, CaptureEvent, Direction, Meta, SessionClock, StreamId};

const READ_BUFFER: usize = 16 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct TapInput {
    name: String,
    settings: TapSettings,
    assembler: AssemblerConfig,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl TapInput {
    pub fn new(name: String, settings: &TapSettings, capture: &CaptureConfig) -> Self {
        Self {
            name,
            settings: settings.clone(),
            assembler: capture.assembler(),
            bound: watch::channel(None).0,
        }
    }

    /// Resolves to the listening address once `run` has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.bound.subscribe();
        let bound = rx.wait_for(Option::is_some).await.ok()?;
        *bound
    }
}

#[async_trait]
impl Input for TapInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "tap"
    }

    async fn run(&self, sink: ExchangeSink, mut shutdown: ShutdownSignal) -> Result<(), ReplayError> {
        let listener = Listener::bind(&self.settings.listen, self.settings.max_connections)
            .await
            .map_err(|e| ReplayError::ResourceExhaustion {
                input: self.name.clone(),
                source: e.into(),
            })?;
        let local = listener.local_addr()?;
        self.bound.send_replace(Some(local));
        info!(
            input = %self.name,
            listen = %local,
            upstream = %self.settings.upstream,
            "tap capturing"
        );

        let stats = sink.stats().clone();
        let (events, events_rx) = mpsc::channel(self.settings.buffer_capacity.max(1));
        let assembler = Assembler::new(self.assembler, SessionClock::new());
        let assembling = tokio::spawn(assemble(self.name.clone(), assembler, events_rx, sink));

        let tracker = ConnectionTracker::new();
        let upstream: Arc<str> = Arc::from(self.settings.upstream.as_str());
        let connect_timeout = Duration::from_secs(self.settings.connection_timeout_secs);
        let input: Arc<str> = Arc::from(self.name.as_str());

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer, permit)) => {
                        let guard = tracker.track();
                        stats.active_connections.store(tracker.active_count(), Ordering::Relaxed);
                        let capture = Capture::new(guard.stream(), events.clone(), stats.clone(), input.clone());
                        let upstream = upstream.clone();
                        let shutdown = shutdown.clone();
                        let stats = stats.clone();
                        let tracker = tracker.clone();
                        tokio::spawn(async move {
                            proxy(client, peer, &upstream, connect_timeout, capture, guard, shutdown).await;
                            drop(permit);
                            stats.active_connections.store(tracker.active_count(), Ordering::Relaxed);
                        });
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        warn!(input = %self.name, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        drop(listener);
        if !tracker.wait_idle(connect_timeout).await {
            warn!(input = %self.name, active = tracker.active_count(), "connections still open at shutdown");
        }
        drop(events);
        if let Err(e) = assembling.await {
            warn!(input = %self.name, error = %e, "assembler task ended abnormally");
        }
        info!(input = %self.name, stats = ?stats.snapshot(), "tap stopped");
        Ok(())
    }
}

/// Drive the assembler from capture events and emit what it completes.
async fn assemble(
    input: String,
    mut assembler: Assembler,
    mut events: mpsc::Receiver<CaptureEvent>,
    sink: ExchangeSink,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ready = Vec::new();

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = assembler.handle(event, now(), &mut ready) {
                        warn!(input = %input, error = %e, "stream abandoned");
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                assembler.sweep(now(), &mut ready);
            }
        }
        for exchange in ready.drain(..) {
            sink.emit(exchange).await;
        }
        publish(&input, &assembler, sink.stats());
    }

    assembler.close_all(&mut ready);
    for exchange in ready.drain(..) {
        sink.emit(exchange).await;
    }
    publish(&input, &assembler, sink.stats());
}

fn publish(input: &str, assembler: &Assembler, stats: &InputStats) {
    let framing = assembler.stats();
    let correlation = assembler.correlator_stats();
    stats.framing_errors.store(framing.framing_errors, Ordering::Relaxed);
    stats.streams_opened.store(framing.streams_opened, Ordering::Relaxed);
    stats.orphaned.store(correlation.orphaned, Ordering::Relaxed);
    metrics::publish_capture_totals(input, framing.framing_errors, correlation.orphaned);
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// The capture side of one proxied connection.
struct Capture {
    stream: StreamId,
    events: mpsc::Sender<CaptureEvent>,
    active: AtomicBool,
    stats: Arc<InputStats>,
    input: Arc<str>,
}

impl Capture {
    fn new(stream: StreamId, events: mpsc::Sender<CaptureEvent>, stats: Arc<InputStats>, input: Arc<str>) -> Self {
        Self {
            stream,
            events,
            active: AtomicBool::new(true),
            stats,
            input,
        }
    }

    fn offer(&self, event: CaptureEvent) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.active.store(false, Ordering::Relaxed);
                self.stats.capture_overflows.fetch_add(1, Ordering::Relaxed);
                warn!(input = %self.input, stream = %self.stream, "capture falling behind, stream no longer captured");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.active.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Final event for the stream. Waits for room: the connection is already
    /// over, so nothing live is held up.
    async fn close(self) {
        if !self.active.load(Ordering::Relaxed) {
            let _ = self.events.send(CaptureEvent::Truncated { stream: self.stream }).await;
        }
        let _ = self.events.send(CaptureEvent::Closed { stream: self.stream }).await;
    }
}

async fn proxy(
    client: TcpStream,
    peer: SocketAddr,
    upstream: &str,
    connect_timeout: Duration,
    capture: Capture,
    guard: ConnectionGuard,
    mut shutdown: ShutdownSignal,
) {
    let stream = guard.stream();
    let server = match tokio::time::timeout(connect_timeout, TcpStream::connect(upstream)).await {
        Ok(Ok(server)) => server,
        Ok(Err(e)) => {
            warn!(%stream, %peer, upstream, error = %e, "upstream connect failed");
            return;
        }
        Err(_) => {
            warn!(%stream, %peer, upstream, "upstream connect timed out");
            return;
        }
    };
    let _ = client.set_nodelay(true);
    let _ = server.set_nodelay(true);

    let mut meta = Meta::new();
    meta.insert("source".to_string(), peer.to_string());
    meta.insert("upstream".to_string(), upstream.to_string());
    meta.insert("input".to_string(), capture.input.to_string());
    capture.offer(CaptureEvent::Opened { stream, meta });
    debug!(%stream, %peer, "proxying connection");

    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();
    let both = async {
        let (requests, responses) = tokio::join!(
            pump(client_read, server_write, Direction::Request, &capture),
            pump(server_read, client_write, Direction::Response, &capture),
        );
        if let Err(e) = requests.and(responses) {
            debug!(%stream, error = %e, "connection ended with error");
        }
    };
    tokio::select! {
        _ = both => {}
        _ = shutdown.recv() => debug!(%stream, "closing connection for shutdown"),
    }

    capture.close().await;
    drop(guard);
}

/// Copy one direction, forwarding each chunk before teeing it.
async fn pump(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    direction: Direction,
    capture: &Capture,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        buf.reserve(READ_BUFFER);
        if from.read_buf(&mut buf).await? == 0 {
            to.shutdown().await?;
            return Ok(());
        }
        let chunk = buf.split().freeze();
        to.write_all(&chunk).await?;
        capture.offer(CaptureEvent::Data {
            stream: capture.stream,
            direction,
            bytes: chunk,
        });
    }
}

//! HTTP listener Input.
//!
//! Accepts HTTP/1.x connections, frames requests and answers each one with an
//! empty `200 OK`. Every request is emitted as a request-only exchange, which
//! makes this Input a sink for traffic mirrored by another tool.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Input;
use crate::config::plugin::ListenSettings;
use crate::config::schema::CaptureConfig;
use crate::emitter::ExchangeSink;
use crate::error::{FramingError, ReplayError};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::{ConnectionGuard, ConnectionTracker, Listener, ListenerError};
use crate::protocol::{CorrelatedExchange, Direction, Framer, FramerLimits, Message, MessageId, SessionClock};

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ListenInput {
    name: String,
    settings: ListenSettings,
    limits: FramerLimits,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl ListenInput {
    pub fn new(name: String, settings: &ListenSettings, capture: &CaptureConfig) -> Self {
        Self {
            name,
            settings: settings.clone(),
            limits: capture.assembler().limits,
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
impl Input for ListenInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "listen"
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
        info!(input = %self.name, listen = %local, "listening for mirrored requests");

        let tracker = ConnectionTracker::new();
        let clock = SessionClock::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer, permit)) => {
                        let session = Session {
                            guard: tracker.track(),
                            peer,
                            limits: self.limits,
                            clock,
                            sink: sink.clone(),
                        };
                        sink.stats().active_connections.store(tracker.active_count(), Ordering::Relaxed);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            session.serve(socket, shutdown).await;
                            drop(permit);
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
        if !tracker.wait_idle(DRAIN_TIMEOUT).await {
            warn!(input = %self.name, active = tracker.active_count(), "connections still open at shutdown");
        }
        Ok(())
    }
}

struct Session {
    guard: ConnectionGuard,
    peer: SocketAddr,
    limits: FramerLimits,
    clock: SessionClock,
    sink: ExchangeSink,
}

impl Session {
    async fn serve(self, mut socket: TcpStream, mut shutdown: ShutdownSignal) {
        let stream = self.guard.stream();
        self.sink.stats().streams_opened.fetch_add(1, Ordering::Relaxed);
        let mut framer = Framer::new(Direction::Request, self.limits);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut seq = 0;

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = shutdown.recv() => break,
                read = socket.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => framer.push(&buf),
                Err(e) => {
                    debug!(%stream, error = %e, "read failed");
                    break;
                }
            }

            loop {
                match framer.next_frame() {
                    Ok(Some(frame)) => {
                        if let Err(e) = socket.write_all(OK_RESPONSE).await {
                            debug!(%stream, error = %e, "write failed");
                            return self.finish();
                        }
                        let request = Message::new(
                            MessageId::new(stream, seq),
                            Direction::Request,
                            frame,
                            self.clock.offset_ns(tokio::time::Instant::now().into_std()),
                        )
                        .with_meta("source", self.peer.to_string())
                        .with_meta("input", self.sink.input());
                        seq += 1;
                        self.sink.emit(CorrelatedExchange::new(request)).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.reject(&mut socket, e).await;
                        return self.finish();
                    }
                }
            }
        }
        self.finish();
    }

    async fn reject(&self, socket: &mut TcpStream, error: FramingError) {
        let stats = self.sink.stats();
        stats.framing_errors.fetch_add(1, Ordering::Relaxed);
        warn!(stream = %self.guard.stream(), peer = %self.peer, error = %error, "malformed request, closing connection");
        let _ = socket.write_all(BAD_REQUEST).await;
        let _ = socket.shutdown().await;
    }

    fn finish(self) {
        debug!(stream = %self.guard.stream(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{DeliverySettings, Emitter};
    use crate::error::OutputError;
    use crate::lifecycle::shutdown::Shutdown;
    use crate::observability::InputStats;
    use crate::output::Output;
    use crate::shaping::ExchangeFilter;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collect(Mutex<Vec<CorrelatedExchange>>);

    #[async_trait]
    impl Output for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn kind(&self) -> &'static str {
            "test"
        }

        async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
            self.0.lock().unwrap().push(exchange.clone());
            Ok(())
        }
    }

    async fn read_reply(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut reply = Vec::new();
        while reply.len() < expected {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }
        reply
    }

    #[tokio::test]
    async fn answers_and_emits_requests() {
        let settings = ListenSettings {
            name: None,
            listen: "127.0.0.1:0".to_string(),
            max_connections: 4,
        };
        let input = Arc::new(ListenInput::new("listen-0".to_string(), &settings, &CaptureConfig::default()));
        let shutdown = Shutdown::new();
        let emitter = Emitter::new(ExchangeFilter::default(), shutdown.subscribe());
        let collect = Arc::new(Collect::default());
        emitter.add_output(collect.clone(), DeliverySettings::default()).await.unwrap();
        let stats = Arc::new(InputStats::default());
        let sink = emitter.sink("listen-0", stats.clone());

        let running = {
            let input = input.clone();
            let signal = shutdown.subscribe();
            tokio::spawn(async move { input.run(sink, signal).await })
        };
        let addr = input.local_addr().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nhiGET /b HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut client, OK_RESPONSE.len() * 2).await;
        assert_eq!(reply, [OK_RESPONSE, OK_RESPONSE].concat());

        client.write_all(b"NOT HTTP\r\n\r\n").await.unwrap();
        let reply = read_reply(&mut client, BAD_REQUEST.len()).await;
        assert!(reply.starts_with(b"HTTP/1.1 400"));
        drop(client);

        shutdown.trigger();
        running.await.unwrap().unwrap();
        emitter.drain(Duration::from_secs(5)).await;

        let seen = collect.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].request().payload().ends_with(b"hi"));
        assert!(seen[1].request().payload().starts_with(b"GET /b"));
        assert!(seen[1].response().is_none());
        assert_eq!(stats.snapshot().framing_errors, 1);
    }
}

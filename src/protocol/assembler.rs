//! Capture events in, correlated exchanges out.
//!
//! # Data Flow
//! ```text
//! CaptureEvent ──► StreamTable ──► Framer (per direction) ──► Message
//!                                                               │
//!                        CorrelatedExchange ◄── Correlator ◄────┘
//! ```
//!
//! One Assembler belongs to one Input and is driven from a single task, so no
//! stream state is ever shared or locked.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::correlator::{Correlator, CorrelatorConfig, CorrelatorStats};
use super::http::{is_head_request, response_status};
use super::message::{CorrelatedExchange, Direction, Message, MessageId, Meta, SessionClock, StreamId};
use super::parser::FramerLimits;
use super::stream::{StreamState, StreamTable, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_STREAMS};
use crate::error::{FramingError, ReplayError};

/// What a capture source observed.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Opened { stream: StreamId, meta: Meta },
    Data { stream: StreamId, direction: Direction, bytes: Bytes },
    Closed { stream: StreamId },
    /// The source lost bytes of this stream; nothing more of it can be framed.
    Truncated { stream: StreamId },
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub limits: FramerLimits,
    pub correlator: CorrelatorConfig,
    pub idle_timeout: Duration,
    pub max_streams: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            limits: FramerLimits::default(),
            correlator: CorrelatorConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerStats {
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub framing_errors: u64,
    pub upgrades: u64,
    pub discarded_bytes: u64,
}

enum FrameOutcome {
    Continue,
    /// `101 Switching Protocols`: what follows is not HTTP/1.x.
    Upgraded,
}

pub struct Assembler {
    clock: SessionClock,
    limits: FramerLimits,
    streams: StreamTable,
    correlator: Correlator,
    stats: AssemblerStats,
}

impl Assembler {
    pub fn new(config: AssemblerConfig, clock: SessionClock) -> Self {
        Self {
            clock,
            limits: config.limits,
            streams: StreamTable::new(config.max_streams, config.idle_timeout),
            correlator: Correlator::new(config.correlator),
            stats: AssemblerStats::default(),
        }
    }

    /// Apply one capture event; completed exchanges are appended to `out`.
    ///
    /// A framing error abandons only the offending stream. It is returned so
    /// the caller can log and count it; the Assembler stays usable.
    pub fn handle(
        &mut self,
        event: CaptureEvent,
        now: Instant,
        out: &mut Vec<CorrelatedExchange>,
    ) -> Result<(), ReplayError> {
        match event {
            CaptureEvent::Opened { stream, meta } => {
                if self.streams.get_mut(stream).is_some() {
                    self.close(stream, out);
                }
                let state = StreamState::new(stream, self.limits, meta, now);
                if let Some(evicted) = self.streams.insert(state) {
                    tracing::debug!(stream = %evicted.id(), "Stream table full, evicting least recent stream");
                    self.finish_stream(evicted, out);
                }
                self.stats.streams_opened += 1;
                Ok(())
            }
            CaptureEvent::Data {
                stream,
                direction,
                bytes,
            } => self.data(stream, direction, &bytes, now, out),
            CaptureEvent::Closed { stream } => {
                self.close(stream, out);
                Ok(())
            }
            CaptureEvent::Truncated { stream } => {
                if let Some(state) = self.streams.get_mut(stream) {
                    if !state.is_abandoned() {
                        self.stats.discarded_bytes += state.abandon() as u64;
                        self.correlator.close_stream(stream);
                        tracing::debug!(%stream, "Capture truncated, no longer framing stream");
                    }
                }
                Ok(())
            }
        }
    }

    /// Close idle streams and orphan timed-out requests. Returns the number of
    /// streams closed.
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<CorrelatedExchange>) -> usize {
        let idle = self.streams.idle(now);
        for stream in &idle {
            tracing::debug!(%stream, "Closing idle stream");
            self.close(*stream, out);
        }
        self.correlator.evict_expired(now);
        idle.len()
    }

    /// Close every stream, e.g. when the Input stops.
    pub fn close_all(&mut self, out: &mut Vec<CorrelatedExchange>) {
        for stream in self.streams.ids() {
            self.close(stream, out);
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.correlator.stats()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn pending_exchanges(&self) -> usize {
        self.correlator.pending()
    }

    fn data(
        &mut self,
        stream: StreamId,
        direction: Direction,
        bytes: &[u8],
        now: Instant,
        out: &mut Vec<CorrelatedExchange>,
    ) -> Result<(), ReplayError> {
        let Some(state) = self.streams.get_mut(stream) else {
            self.stats.discarded_bytes += bytes.len() as u64;
            return Ok(());
        };
        if state.is_abandoned() {
            self.stats.discarded_bytes += bytes.len() as u64;
            return Ok(());
        }
        state.touch(now);
        state.framer_mut(direction).push(bytes);

        loop {
            let frame = match state.framer_mut(direction).next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(source) => {
                    let discarded = state.abandon();
                    self.stats.framing_errors += 1;
                    self.stats.discarded_bytes += discarded as u64;
                    self.correlator.close_stream(stream);
                    return Err(framing(stream, source));
                }
            };

            let outcome = accept_frame(state, &mut self.correlator, self.clock, direction, frame, now, out);
            if let FrameOutcome::Upgraded = outcome {
                let discarded = state.abandon();
                self.stats.upgrades += 1;
                self.stats.discarded_bytes += discarded as u64;
                tracing::debug!(%stream, "Protocol upgrade, no longer capturing stream");
                return Ok(());
            }
        }
    }

    fn close(&mut self, stream: StreamId, out: &mut Vec<CorrelatedExchange>) {
        if let Some(state) = self.streams.remove(stream) {
            self.finish_stream(state, out);
        }
    }

    fn finish_stream(&mut self, mut state: StreamState, out: &mut Vec<CorrelatedExchange>) {
        let stream = state.id();
        let now = Instant::now().max(state.last_activity());

        if !state.is_abandoned() {
            let buffered = state.framer_mut(Direction::Response).buffered();
            if let Some(frame) = state.framer_mut(Direction::Response).finish() {
                let leftover = buffered - frame.len();
                self.stats.discarded_bytes += leftover as u64;
                accept_frame(&mut state, &mut self.correlator, self.clock, Direction::Response, frame, now, out);
            } else {
                self.stats.discarded_bytes += buffered as u64;
            }
            let partial = state.framer_mut(Direction::Request).buffered();
            state.framer_mut(Direction::Request).finish();
            self.stats.discarded_bytes += partial as u64;
            if partial + buffered > 0 {
                tracing::debug!(%stream, request_bytes = partial, "Discarding unframed bytes at close");
            }
        }

        self.correlator.close_stream(stream);
        self.stats.streams_closed += 1;
    }
}

fn accept_frame(
    state: &mut StreamState,
    correlator: &mut Correlator,
    clock: SessionClock,
    direction: Direction,
    frame: Bytes,
    now: Instant,
    out: &mut Vec<CorrelatedExchange>,
) -> FrameOutcome {
    let mut outcome = FrameOutcome::Continue;
    match direction {
        Direction::Request => {
            state
                .framer_mut(Direction::Response)
                .note_request(is_head_request(&frame));
        }
        Direction::Response => match response_status(&frame) {
            Some(101) => outcome = FrameOutcome::Upgraded,
            // Interim responses precede the real one and answer nothing.
            Some(status) if status < 200 => return FrameOutcome::Continue,
            _ => {}
        },
    }

    let id = MessageId::new(state.id(), state.take_seq(direction));
    let message = Message::new(id, direction, frame, clock.offset_ns(now)).with_meta_map(state.meta());
    if let Some(exchange) = correlator.submit(state.id(), message, now) {
        out.push(exchange);
    }
    outcome
}

fn framing(stream: StreamId, source: FramingError) -> ReplayError {
    ReplayError::Framing { stream, source }
}

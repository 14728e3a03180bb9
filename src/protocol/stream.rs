//! Per-stream framing state.
//!
//! The table is an arena keyed by [`StreamId`]. Entries are created when a
//! stream opens and destroyed on close, on idle timeout, or when the table is
//! full and the least recently active stream has to make room.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::message::{Direction, Meta, StreamId};
use super::parser::{Framer, FramerLimits};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_STREAMS: usize = 10_000;

/// Framers and counters for one captured connection.
#[derive(Debug)]
pub struct StreamState {
    id: StreamId,
    request: Framer,
    response: Framer,
    next_request_seq: u64,
    next_response_seq: u64,
    last_activity: Instant,
    meta: Meta,
    /// Set after a framing error or a protocol upgrade; bytes are ignored from then on.
    abandoned: bool,
}

impl StreamState {
    pub fn new(id: StreamId, limits: FramerLimits, meta: Meta, now: Instant) -> Self {
        Self {
            id,
            request: Framer::new(Direction::Request, limits),
            response: Framer::new(Direction::Response, limits),
            next_request_seq: 0,
            next_response_seq: 0,
            last_activity: now,
            meta,
            abandoned: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn framer_mut(&mut self, direction: Direction) -> &mut Framer {
        match direction {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        }
    }

    /// Claim the sequence number for the next frame in `direction`.
    pub fn take_seq(&mut self, direction: Direction) -> u64 {
        let counter = match direction {
            Direction::Request => &mut self.next_request_seq,
            Direction::Response => &mut self.next_response_seq,
        };
        let seq = *counter;
        *counter += 1;
        seq
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Stop interpreting this stream. Returns the bytes that were discarded.
    pub fn abandon(&mut self) -> usize {
        let discarded = self.request.buffered() + self.response.buffered();
        self.request.reset();
        self.response.reset();
        self.abandoned = true;
        discarded
    }

    /// Bytes buffered in both directions.
    pub fn buffered(&self) -> usize {
        self.request.buffered() + self.response.buffered()
    }
}

/// Arena of live streams for one Input.
#[derive(Debug)]
pub struct StreamTable {
    streams: HashMap<StreamId, StreamState>,
    max_streams: usize,
    idle_timeout: Duration,
}

impl StreamTable {
    pub fn new(max_streams: usize, idle_timeout: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            max_streams: max_streams.max(1),
            idle_timeout,
        }
    }

    /// Insert a new stream. When the table is full the least recently active
    /// stream is removed and returned so the caller can close it.
    pub fn insert(&mut self, state: StreamState) -> Option<StreamState> {
        let evicted = if self.streams.len() >= self.max_streams
            && !self.streams.contains_key(&state.id())
        {
            self.least_recent().and_then(|id| self.streams.remove(&id))
        } else {
            None
        };
        self.streams.insert(state.id(), state);
        evicted
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<StreamState> {
        self.streams.remove(&id)
    }

    /// Streams with no activity for longer than the idle timeout.
    pub fn idle(&self, now: Instant) -> Vec<StreamId> {
        self.streams
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity()) >= self.idle_timeout)
            .map(StreamState::id)
            .collect()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn least_recent(&self) -> Option<StreamId> {
        self.streams
            .values()
            .min_by_key(|s| s.last_activity())
            .map(StreamState::id)
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS, DEFAULT_IDLE_TIMEOUT)
    }
}

//! Messages, stream identities and correlated exchanges.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Annotations carried end-to-end with a message.
pub type Meta = BTreeMap<String, String>;

/// Exchanges are shared between every Output that receives them.
pub type SharedExchange = Arc<CorrelatedExchange>;

/// Global counter for stream IDs.
/// Relaxed ordering is enough, we only need uniqueness.
static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of one captured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate a new process-unique stream ID.
    pub fn next() -> Self {
        Self(STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an ID read back from a recording.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Correlation key: the n-th request and the n-th response of a stream share `seq = n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub stream: StreamId,
    pub seq: u64,
}

impl MessageId {
    pub fn new(stream: StreamId, seq: u64) -> Self {
        Self { stream, seq }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// One complete, framed HTTP message.
///
/// The payload never changes after framing; only metadata may be added, and
/// only before the message is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    direction: Direction,
    payload: Bytes,
    timestamp_ns: u64,
    meta: Meta,
}

impl Message {
    pub fn new(id: MessageId, direction: Direction, payload: Bytes, timestamp_ns: u64) -> Self {
        Self {
            id,
            direction,
            payload,
            timestamp_ns,
            meta: Meta::new(),
        }
    }

    /// Attach an annotation.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Attach several annotations at once.
    pub fn with_meta_map(mut self, meta: &Meta) -> Self {
        self.meta
            .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Capture time in nanoseconds since the session clock started.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}

/// A request and, once matched, its response.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedExchange {
    request: Message,
    response: Option<Message>,
}

impl CorrelatedExchange {
    /// An exchange with no response (yet).
    pub fn new(request: Message) -> Self {
        debug_assert_eq!(request.direction(), Direction::Request);
        Self {
            request,
            response: None,
        }
    }

    pub fn matched(request: Message, response: Message) -> Self {
        debug_assert_eq!(response.direction(), Direction::Response);
        Self {
            request,
            response: Some(response),
        }
    }

    pub fn id(&self) -> MessageId {
        self.request.id()
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    /// Time between request and response capture.
    pub fn latency(&self) -> Option<Duration> {
        self.response.as_ref().map(|r| {
            Duration::from_nanos(r.timestamp_ns().saturating_sub(self.request.timestamp_ns()))
        })
    }

    pub fn into_parts(self) -> (Message, Option<Message>) {
        (self.request, self.response)
    }

    /// Wrap for fan-out.
    pub fn into_shared(self) -> SharedExchange {
        Arc::new(self)
    }
}

/// Monotonic clock for one capture session.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { start }
    }

    /// Nanoseconds between the session start and `at`.
    pub fn offset_ns(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.start).as_nanos() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

//! Request/response correlation.
//!
//! # Matching
//! ```text
//! Request(seq n)  → push onto the stream FIFO
//! Response(seq n) → compare with FIFO head:
//!     head.seq == n → matched, handed back to the caller
//!     head.seq <  n → head lost its response: orphan it, look again
//!     head.seq >  n → response for an already evicted request: drop
//! ```
//!
//! # Design Decisions
//! - Strict FIFO per stream, as HTTP/1.1 without request IDs requires
//! - Bounded: per-stream depth limit plus a timeout sweep
//! - Sequence numbers make redelivery harmless: nothing is emitted twice

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::message::{CorrelatedExchange, Direction, Message, StreamId};

pub const DEFAULT_CORRELATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PENDING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// How long a request may wait for its response.
    pub timeout: Duration,
    /// Maximum unmatched requests per stream.
    pub max_pending: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CORRELATION_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Running totals, reported through the owning Input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub matched: u64,
    pub orphaned: u64,
    pub late_responses: u64,
    pub unsolicited: u64,
    pub duplicates: u64,
}

#[derive(Debug)]
struct Pending {
    request: Message,
    submitted: Instant,
}

#[derive(Debug, Default)]
struct StreamQueue {
    pending: VecDeque<Pending>,
    next_request_seq: u64,
    next_response_seq: u64,
}

/// Pairs requests with responses, one FIFO per stream.
#[derive(Debug, Default)]
pub struct Correlator {
    config: CorrelatorConfig,
    streams: HashMap<StreamId, StreamQueue>,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            stats: CorrelatorStats::default(),
        }
    }

    /// Feed one framed message. Returns the exchange a response completes.
    pub fn submit(
        &mut self,
        stream: StreamId,
        message: Message,
        now: Instant,
    ) -> Option<CorrelatedExchange> {
        debug_assert_eq!(message.id().stream, stream);
        match message.direction() {
            Direction::Request => {
                self.push_request(stream, message, now);
                None
            }
            Direction::Response => self.match_response(stream, message),
        }
    }

    /// Orphan every request older than the timeout. Returns how many were evicted.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let timeout = self.config.timeout;
        let mut evicted = 0;
        for (stream, queue) in self.streams.iter_mut() {
            while let Some(head) = queue.pending.front() {
                if now.saturating_duration_since(head.submitted) < timeout {
                    break;
                }
                if let Some(orphan) = queue.pending.pop_front() {
                    record_orphan(&mut self.stats, *stream, orphan, "timeout");
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// The stream is gone; whatever is still pending is orphaned.
    pub fn close_stream(&mut self, stream: StreamId) -> usize {
        let Some(queue) = self.streams.remove(&stream) else {
            return 0;
        };
        let count = queue.pending.len();
        for orphan in queue.pending {
            record_orphan(&mut self.stats, stream, orphan, "stream closed");
        }
        count
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    /// Requests currently waiting for a response, across all streams.
    pub fn pending(&self) -> usize {
        self.streams.values().map(|q| q.pending.len()).sum()
    }

    pub fn pending_on(&self, stream: StreamId) -> usize {
        self.streams.get(&stream).map_or(0, |q| q.pending.len())
    }

    fn push_request(&mut self, stream: StreamId, request: Message, now: Instant) {
        let seq = request.id().seq;
        let queue = self.streams.entry(stream).or_default();
        if seq < queue.next_request_seq {
            self.stats.duplicates += 1;
            tracing::trace!(id = %request.id(), "Duplicate request ignored");
            return;
        }
        queue.next_request_seq = seq + 1;
        queue.pending.push_back(Pending {
            request,
            submitted: now,
        });

        if queue.pending.len() > self.config.max_pending {
            if let Some(orphan) = queue.pending.pop_front() {
                record_orphan(&mut self.stats, stream, orphan, "pending depth exceeded");
            }
        }
    }

    fn match_response(&mut self, stream: StreamId, response: Message) -> Option<CorrelatedExchange> {
        let seq = response.id().seq;
        let Some(queue) = self.streams.get_mut(&stream) else {
            self.stats.unsolicited += 1;
            return None;
        };

        if seq < queue.next_response_seq {
            self.stats.duplicates += 1;
            tracing::trace!(id = %response.id(), "Duplicate response ignored");
            return None;
        }
        queue.next_response_seq = seq + 1;

        loop {
            let Some(head_seq) = queue.pending.front().map(|p| p.request.id().seq) else {
                if seq < queue.next_request_seq {
                    self.stats.late_responses += 1;
                } else {
                    self.stats.unsolicited += 1;
                }
                return None;
            };

            if head_seq > seq {
                self.stats.late_responses += 1;
                tracing::debug!(id = %response.id(), "Response arrived after its request was evicted");
                return None;
            }

            let pending = queue.pending.pop_front()?;
            if head_seq == seq {
                self.stats.matched += 1;
                return Some(CorrelatedExchange::matched(pending.request, response));
            }
            record_orphan(&mut self.stats, stream, pending, "response missing");
        }
    }
}

fn record_orphan(stats: &mut CorrelatorStats, stream: StreamId, orphan: Pending, reason: &str) {
    stats.orphaned += 1;
    tracing::debug!(
        %stream,
        id = %orphan.request.id(),
        reason,
        "Exchange orphaned"
    );
}

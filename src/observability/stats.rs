//! In-process counters behind the diagnostics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one Input.
#[derive(Debug, Default)]
pub struct InputStats {
    pub captured: AtomicU64,
    pub filtered: AtomicU64,
    pub framing_errors: AtomicU64,
    pub orphaned: AtomicU64,
    pub streams_opened: AtomicU64,
    /// Streams whose capture stopped because the assembler fell behind.
    pub capture_overflows: AtomicU64,
    pub active_connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputStatsSnapshot {
    pub captured: u64,
    pub filtered: u64,
    pub framing_errors: u64,
    pub orphaned: u64,
    pub streams_opened: u64,
    pub capture_overflows: u64,
    pub active_connections: u64,
}

impl InputStats {
    pub fn snapshot(&self) -> InputStatsSnapshot {
        InputStatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            capture_overflows: self.capture_overflows.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one Output.
#[derive(Debug, Default)]
pub struct OutputStats {
    pub enqueued: AtomicU64,
    /// Currently waiting in the queue or the rate-limit backlog.
    pub queued: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped_overload: AtomicU64,
    pub dropped_rate_limit: AtomicU64,
    pub skipped_sample: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    /// Replayed status differed from the recorded one.
    pub status_mismatches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputStatsSnapshot {
    pub enqueued: u64,
    pub queued: u64,
    pub delivered: u64,
    pub dropped_overload: u64,
    pub dropped_rate_limit: u64,
    pub skipped_sample: u64,
    pub failed: u64,
    pub retries: u64,
    pub status_mismatches: u64,
}

impl OutputStats {
    pub fn snapshot(&self) -> OutputStatsSnapshot {
        OutputStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_overload: self.dropped_overload.load(Ordering::Relaxed),
            dropped_rate_limit: self.dropped_rate_limit.load(Ordering::Relaxed),
            skipped_sample: self.skipped_sample.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            status_mismatches: self.status_mismatches.load(Ordering::Relaxed),
        }
    }
}

impl OutputStatsSnapshot {
    /// Everything that left the queue without being delivered.
    pub fn dropped(&self) -> u64 {
        self.dropped_overload + self.dropped_rate_limit + self.skipped_sample + self.failed
    }
}

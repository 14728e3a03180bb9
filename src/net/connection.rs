//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Assign each accepted connection its [`StreamId`]
//! - Count live connections for diagnostics
//! - Let shutdown wait until in-flight connections have closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::protocol::StreamId;

/// Tracks active connections of one Input.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    closed: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            closed: Arc::clone(&self.closed),
            stream: StreamId::next(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Connections accepted since start.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Wait until all connections are closed or `timeout` expires.
    /// Returns whether everything closed in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.closed.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    closed: Arc<Notify>,
    stream: StreamId,
}

impl ConnectionGuard {
    /// The stream identity assigned to this connection.
    pub fn stream(&self) -> StreamId {
        self.stream
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        self.closed.notify_waiters();
        tracing::trace!(stream = %self.stream, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(guard1.stream(), guard2.stream());

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total(), 2);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();
        assert!(!tracker.wait_idle(Duration::from_millis(50)).await);
    }
}

//! Replay rate limiting.
//!
//! `rate_limit = "N"` smooths delivery to N exchanges per second with a token
//! bucket; exchanges arriving faster wait in a backlog of ⌈N⌉ entries and the
//! oldest is dropped when it overflows. `rate_limit = "P%"` passes a fixed
//! fraction of exchanges without delaying any of them.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Burst allowance: this much time worth of tokens, at least one.
const BURST_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid rate limit {0:?}: expected \"N\", \"N/s\" or \"P%\"")]
pub struct RateLimitParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RateLimit {
    /// Exchanges per second.
    PerSecond(f64),
    /// Percentage of exchanges, 0-100.
    Percent(f64),
}

impl FromStr for RateLimit {
    type Err = RateLimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RateLimitParseError(s.to_string());
        let trimmed = s.trim();

        if let Some(percent) = trimmed.strip_suffix('%') {
            let value: f64 = percent.trim().parse().map_err(|_| err())?;
            if !(0.0..=100.0).contains(&value) {
                return Err(err());
            }
            return Ok(RateLimit::Percent(value));
        }

        let number = trimmed
            .strip_suffix("/s")
            .or_else(|| trimmed.strip_suffix("/sec"))
            .unwrap_or(trimmed);
        let value: f64 = number.trim().parse().map_err(|_| err())?;
        if !value.is_finite() || value <= 0.0 {
            return Err(err());
        }
        Ok(RateLimit::PerSecond(value))
    }
}

impl TryFrom<String> for RateLimit {
    type Error = RateLimitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimit> for String {
    fn from(limit: RateLimit) -> Self {
        limit.to_string()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimit::PerSecond(n) => write!(f, "{n}/s"),
            RateLimit::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// A token bucket driven by explicit instants.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    pub fn new(per_second: f64, now: Instant) -> Self {
        let capacity = (per_second * BURST_WINDOW.as_secs_f64()).max(1.0);
        Self {
            tokens: capacity,
            last_update: now,
            capacity,
            refill_rate: per_second,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Earliest instant at which a token will be available.
    pub fn next_token_at(&self, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if tokens >= 1.0 {
            return now;
        }
        now + Duration::from_secs_f64((1.0 - tokens) / self.refill_rate)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Result of offering an item to a [`Throttle`].
#[derive(Debug, PartialEq)]
pub enum Offer<T> {
    /// A token was available; deliver now.
    Ready(T),
    /// Parked in the backlog; `evicted` is the oldest entry it displaced.
    Queued { evicted: Option<T> },
}

/// Token bucket plus a bounded drop-oldest backlog.
#[derive(Debug)]
pub struct Throttle<T> {
    bucket: TokenBucket,
    backlog: VecDeque<T>,
    max_backlog: usize,
}

impl<T> Throttle<T> {
    pub fn new(per_second: f64, now: Instant) -> Self {
        let max_backlog = per_second.ceil().max(1.0) as usize;
        Self {
            bucket: TokenBucket::new(per_second, now),
            backlog: VecDeque::with_capacity(max_backlog.min(1024)),
            max_backlog,
        }
    }

    pub fn offer(&mut self, item: T, now: Instant) -> Offer<T> {
        if self.backlog.is_empty() && self.bucket.try_acquire(now) {
            return Offer::Ready(item);
        }
        self.backlog.push_back(item);
        let evicted = if self.backlog.len() > self.max_backlog {
            self.backlog.pop_front()
        } else {
            None
        };
        Offer::Queued { evicted }
    }

    /// Take the next backlog entry if a token is available.
    pub fn release(&mut self, now: Instant) -> Option<T> {
        if self.backlog.is_empty() || !self.bucket.try_acquire(now) {
            return None;
        }
        self.backlog.pop_front()
    }

    /// When the next backlog entry can go out, if any is waiting.
    pub fn next_release(&self, now: Instant) -> Option<Instant> {
        if self.backlog.is_empty() {
            return None;
        }
        Some(self.bucket.next_token_at(now))
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }
}

/// Deterministic credit gate passing a fixed percentage.
#[derive(Debug, Clone)]
pub struct PercentGate {
    share: f64,
    credit: f64,
}

impl PercentGate {
    pub fn new(percent: f64) -> Self {
        Self {
            share: (percent / 100.0).clamp(0.0, 1.0),
            credit: 0.0,
        }
    }

    pub fn admit(&mut self) -> bool {
        self.credit += self.share;
        if self.credit >= 1.0 - f64::EPSILON {
            self.credit -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!("10".parse::<RateLimit>().unwrap(), RateLimit::PerSecond(10.0));
        assert_eq!("2.5/s".parse::<RateLimit>().unwrap(), RateLimit::PerSecond(2.5));
        assert_eq!("25%".parse::<RateLimit>().unwrap(), RateLimit::Percent(25.0));
        assert!("0".parse::<RateLimit>().is_err());
        assert!("150%".parse::<RateLimit>().is_err());
        assert!("fast".parse::<RateLimit>().is_err());
    }

    #[test]
    fn bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1.0, start);
        assert!(bucket.try_acquire(start));
        assert!(!bucket.try_acquire(start));
        assert_eq!(bucket.next_token_at(start), start + Duration::from_secs(1));
        assert!(bucket.try_acquire(start + Duration::from_secs(1)));
    }

    #[test]
    fn burst_is_ten_milliseconds_of_tokens() {
        let now = Instant::now();
        assert_eq!(TokenBucket::new(1.0, now).capacity(), 1.0);
        assert_eq!(TokenBucket::new(1000.0, now).capacity(), 10.0);
    }

    #[test]
    fn backlog_drops_oldest() {
        let start = Instant::now();
        let mut throttle = Throttle::new(2.0, start);
        assert_eq!(throttle.offer(1, start), Offer::Ready(1));
        assert_eq!(throttle.offer(2, start), Offer::Queued { evicted: None });
        assert_eq!(throttle.offer(3, start), Offer::Queued { evicted: None });
        assert_eq!(throttle.offer(4, start), Offer::Queued { evicted: Some(2) });
        assert_eq!(throttle.backlog(), 2);

        assert_eq!(throttle.release(start), None);
        let later = start + Duration::from_millis(500);
        assert_eq!(throttle.next_release(start), Some(later));
        assert_eq!(throttle.release(later), Some(3));
    }

    #[test]
    fn percent_gate_is_exact_over_a_window() {
        let mut gate = PercentGate::new(25.0);
        let passed = (0..100).filter(|_| gate.admit()).count();
        assert_eq!(passed, 25);

        let mut none = PercentGate::new(0.0);
        assert!((0..10).all(|_| !none.admit()));
    }
}

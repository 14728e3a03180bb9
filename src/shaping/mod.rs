//! Traffic shaping: filtering, sampling and rate limiting.
//!
//! # Data Flow
//! ```text
//! Emitter: ExchangeFilter (global, before fan-out)
//!     ↓
//! Output worker: Sampler → PercentGate | Throttle → send
//! ```
//!
//! # Design Decisions
//! - Shaping state belongs to one Output worker, never shared
//! - Time is passed in explicitly so shaping can be tested without sleeping
//! - The throttle backlog is bounded; overflow drops the oldest entry

pub mod filter;
pub mod rate_limit;
pub mod sampler;

pub use filter::{ExchangeFilter, FilterError};
pub use rate_limit::{Offer, PercentGate, RateLimit, RateLimitParseError, Throttle, TokenBucket};
pub use sampler::Sampler;

use std::time::Instant;

/// What the shaper decided for one exchange.
#[derive(Debug, PartialEq)]
pub enum Admission<T> {
    /// Send now.
    Deliver(T),
    /// Held back by the rate limit; `evicted` was dropped to make room.
    Held { evicted: Option<T> },
    /// Not selected by `sample_rate`.
    Sampled,
    /// Not selected by a percentage rate limit.
    RateLimited,
}

#[derive(Debug)]
enum Limiter<T> {
    Unlimited,
    Percent(PercentGate),
    Throttle(Throttle<T>),
}

/// Per-Output shaping pipeline.
#[derive(Debug)]
pub struct Shaper<T> {
    sampler: Sampler,
    limiter: Limiter<T>,
}

impl<T> Shaper<T> {
    pub fn new(sample_rate: f64, rate_limit: Option<RateLimit>, now: Instant) -> Self {
        Self::with_sampler(Sampler::new(sample_rate), rate_limit, now)
    }

    pub fn with_sampler(sampler: Sampler, rate_limit: Option<RateLimit>, now: Instant) -> Self {
        let limiter = match rate_limit {
            None => Limiter::Unlimited,
            Some(RateLimit::Percent(p)) => Limiter::Percent(PercentGate::new(p)),
            Some(RateLimit::PerSecond(n)) => Limiter::Throttle(Throttle::new(n, now)),
        };
        Self { sampler, limiter }
    }

    pub fn admit(&mut self, item: T, now: Instant) -> Admission<T> {
        if !self.sampler.sample() {
            return Admission::Sampled;
        }
        match &mut self.limiter {
            Limiter::Unlimited => Admission::Deliver(item),
            Limiter::Percent(gate) => {
                if gate.admit() {
                    Admission::Deliver(item)
                } else {
                    Admission::RateLimited
                }
            }
            Limiter::Throttle(throttle) => match throttle.offer(item, now) {
                Offer::Ready(item) => Admission::Deliver(item),
                Offer::Queued { evicted } => Admission::Held { evicted },
            },
        }
    }

    /// Next held item whose turn has come.
    pub fn release(&mut self, now: Instant) -> Option<T> {
        match &mut self.limiter {
            Limiter::Throttle(throttle) => throttle.release(now),
            _ => None,
        }
    }

    pub fn next_release(&self, now: Instant) -> Option<Instant> {
        match &self.limiter {
            Limiter::Throttle(throttle) => throttle.next_release(now),
            _ => None,
        }
    }

    pub fn held(&self) -> usize {
        match &self.limiter {
            Limiter::Throttle(throttle) => throttle.backlog(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_delivers_everything() {
        let mut shaper = Shaper::new(1.0, None, Instant::now());
        assert_eq!(shaper.admit(1, Instant::now()), Admission::Deliver(1));
        assert_eq!(shaper.held(), 0);
    }

    #[test]
    fn sampling_runs_before_limiting() {
        let now = Instant::now();
        let mut shaper = Shaper::new(0.0, Some(RateLimit::PerSecond(1.0)), now);
        assert_eq!(shaper.admit(1, now), Admission::Sampled);
        assert_eq!(shaper.held(), 0);
    }

    #[test]
    fn per_second_limit_holds_then_releases() {
        let now = Instant::now();
        let mut shaper = Shaper::new(1.0, Some(RateLimit::PerSecond(1.0)), now);
        assert_eq!(shaper.admit(1, now), Admission::Deliver(1));
        assert_eq!(shaper.admit(2, now), Admission::Held { evicted: None });
        assert_eq!(shaper.admit(3, now), Admission::Held { evicted: Some(2) });

        let next = shaper.next_release(now).unwrap();
        assert_eq!(next, now + Duration::from_secs(1));
        assert_eq!(shaper.release(next), Some(3));
        assert_eq!(shaper.next_release(next), None);
    }

    #[test]
    fn percent_limit_drops_without_holding() {
        let now = Instant::now();
        let mut shaper = Shaper::new(1.0, Some(RateLimit::Percent(50.0)), now);
        assert_eq!(shaper.admit(1, now), Admission::RateLimited);
        assert_eq!(shaper.admit(2, now), Admission::Deliver(2));
    }
}

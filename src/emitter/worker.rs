//! Delivery worker: one task per registered Output.
//!
//! Pulls exchanges off the Output's queue, runs them through the shaper and
//! sends what is admitted, retrying transient failures. When the queue closes
//! it drains the rate-limit backlog at the configured pace, then flushes and
//! closes the Output.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::DeliverySettings;
use crate::observability::metrics::{self, reason};
use crate::observability::OutputStats;
use crate::output::SharedOutput;
use crate::protocol::SharedExchange;
use crate::resilience::retries::RetryPolicy;
use crate::shaping::{Admission, Shaper};

pub(super) struct Worker {
    output: SharedOutput,
    rx: mpsc::Receiver<SharedExchange>,
    shaper: Shaper<SharedExchange>,
    retry: RetryPolicy,
    stats: Arc<OutputStats>,
    /// Bounds concurrent sends for Outputs that allow them.
    in_flight: Option<(Arc<Semaphore>, JoinSet<()>)>,
}

impl Worker {
    pub(super) fn new(
        output: SharedOutput,
        rx: mpsc::Receiver<SharedExchange>,
        settings: &DeliverySettings,
        stats: Arc<OutputStats>,
    ) -> Self {
        let shaper = Shaper::new(settings.sample_rate, settings.rate_limit, now());
        let in_flight = if output.concurrency_safe() && output.max_in_flight() > 1 {
            Some((Arc::new(Semaphore::new(output.max_in_flight())), JoinSet::new()))
        } else {
            None
        };
        Self {
            output,
            rx,
            shaper,
            retry: settings.retry,
            stats,
            in_flight,
        }
    }

    pub(super) async fn run(mut self) {
        let name = self.output.name().to_string();
        debug!(output = %name, "delivery worker started");

        loop {
            while let Some(exchange) = self.shaper.release(now()) {
                self.dispatch(exchange).await;
            }

            let wake = self.shaper.next_release(now());
            tokio::select! {
                biased;
                received = self.rx.recv() => match received {
                    Some(exchange) => self.admit(exchange).await,
                    None => break,
                },
                _ = sleep_until(wake), if wake.is_some() => {}
            }
        }

        // Queue closed: the backlog still goes out at the configured rate.
        while self.shaper.held() > 0 {
            if let Some(wake) = self.shaper.next_release(now()) {
                tokio::time::sleep_until(Instant::from_std(wake)).await;
            }
            while let Some(exchange) = self.shaper.release(now()) {
                self.dispatch(exchange).await;
            }
        }

        if let Some((_, tasks)) = self.in_flight.as_mut() {
            while tasks.join_next().await.is_some() {}
        }

        if let Err(e) = self.output.flush().await {
            warn!(output = %name, error = %e, "flush failed");
        }
        if let Err(e) = self.output.close().await {
            warn!(output = %name, error = %e, "close failed");
        }
        info!(output = %name, stats = ?self.stats.snapshot(), "output closed");
    }

    async fn admit(&mut self, exchange: SharedExchange) {
        match self.shaper.admit(exchange, now()) {
            Admission::Deliver(exchange) => self.dispatch(exchange).await,
            Admission::Held { evicted: None } => {}
            Admission::Held {
                evicted: Some(evicted),
            } => {
                debug!(output = %self.output.name(), exchange = %evicted.id(), "rate limit backlog full, oldest dropped");
                self.discard(reason::RATE_LIMIT);
            }
            Admission::Sampled => self.discard(reason::SAMPLED),
            Admission::RateLimited => self.discard(reason::RATE_LIMIT),
        }
    }

    fn discard(&self, why: &'static str) {
        let counter = if why == reason::SAMPLED {
            &self.stats.skipped_sample
        } else {
            &self.stats.dropped_rate_limit
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_dropped(self.output.name(), why);
        settle(&self.stats, self.output.name());
    }

    async fn dispatch(&mut self, exchange: SharedExchange) {
        let Some((permits, tasks)) = self.in_flight.as_mut() else {
            deliver(self.output.clone(), self.retry, self.stats.clone(), exchange).await;
            return;
        };

        while tasks.try_join_next().is_some() {}
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let output = self.output.clone();
        let stats = self.stats.clone();
        let retry = self.retry;
        tasks.spawn(async move {
            deliver(output, retry, stats, exchange).await;
            drop(permit);
        });
    }
}

/// Send one exchange with retries and account for the outcome.
async fn deliver(
    output: SharedOutput,
    retry: RetryPolicy,
    stats: Arc<OutputStats>,
    exchange: SharedExchange,
) {
    let started = Instant::now();
    let target = &output;
    let item = &exchange;
    let outcome = retry.run(move |_| target.send(item)).await;

    if outcome.attempts > 1 {
        stats
            .retries
            .fetch_add(u64::from(outcome.attempts - 1), Ordering::Relaxed);
    }
    match outcome.result {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            metrics::record_delivered(output.name(), started.elapsed().as_secs_f64());
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_failure(output.name());
            warn!(
                output = %output.name(),
                exchange = %exchange.id(),
                attempts = outcome.attempts,
                error = %e,
                "exchange dropped after failed delivery"
            );
        }
    }
    settle(&stats, output.name());
}

/// One exchange left the queue or backlog for good.
fn settle(stats: &OutputStats, output: &str) {
    let depth = stats.queued.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    metrics::set_queue_depth(output, depth as usize);
}

/// Shaping runs on the runtime clock so paused-time tests drive it too.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until(wake: Option<std::time::Instant>) {
    match wake {
        Some(wake) => tokio::time::sleep_until(Instant::from_std(wake)).await,
        None => std::future::pending().await,
    }
}

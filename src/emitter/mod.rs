//! Fan-in/fan-out router between Inputs and Outputs.
//!
//! # Responsibilities
//! - Apply the global request filter once per exchange
//! - Copy every accepted exchange into each registered Output's queue
//! - Own one delivery worker per Output (shaping, retries, flush, close)
//! - Add and remove Outputs while traffic is flowing
//!
//! # Data Flow
//! ```text
//! Input ─┐                      ┌─ queue ─ worker ─ Output A
//! Input ─┼─ ExchangeSink::emit ─┼─ queue ─ worker ─ Output B
//! Input ─┘   (filter, fan-out)  └─ queue ─ worker ─ Output C
//! ```
//!
//! # Design Decisions
//! - The Output list is an `ArcSwap` snapshot: emitting never takes a lock,
//!   and an exchange is copied to exactly the Outputs registered when its
//!   fan-out starts
//! - Exchanges are shared (`Arc`) between queues, never cloned
//! - Each queue is a bounded mpsc channel; when it is full the Output's
//!   overload policy decides between waiting and dropping
//! - A slow Output only ever stalls producers when it asked for `block`
//! - Removing an Output drops its sender; the worker drains what is queued,
//!   flushes, closes and exits

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ReplayError;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::observability::metrics::{self, reason};
use crate::observability::{InputStats, OutputStats, OutputStatsSnapshot};
use crate::output::SharedOutput;
use crate::protocol::{CorrelatedExchange, SharedExchange};
use crate::resilience::retries::RetryPolicy;
use crate::shaping::{ExchangeFilter, RateLimit};

use worker::Worker;

/// What happens when an Output's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// The producer waits for space. Nothing is lost, capture may slow down.
    #[default]
    Block,
    /// The exchange is dropped for this Output and counted.
    Drop,
}

/// Queue, shaping and retry settings for one Output.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    pub buffer_capacity: usize,
    pub overload: OverloadPolicy,
    pub sample_rate: f64,
    pub rate_limit: Option<RateLimit>,
    pub retry: RetryPolicy,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            overload: OverloadPolicy::Block,
            sample_rate: 1.0,
            rate_limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Registered Output as seen by producers.
#[derive(Debug)]
struct OutputSlot {
    name: String,
    kind: &'static str,
    tx: mpsc::Sender<SharedExchange>,
    settings: DeliverySettings,
    stats: Arc<OutputStats>,
}

/// Point-in-time view of one registered Output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub name: String,
    pub kind: &'static str,
    pub overload: OverloadPolicy,
    pub buffer_capacity: usize,
    pub stats: OutputStatsSnapshot,
}

struct Shared {
    registry: ArcSwap<Vec<Arc<OutputSlot>>>,
    /// Worker handles by Output name. Also serializes registry mutation.
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    filter: ExchangeFilter,
    shutdown: ShutdownSignal,
    closed: AtomicBool,
}

/// Routes exchanges from every Input to every Output.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("outputs", &self.shared.registry.load().len())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Emitter {
    /// `shutdown` releases producers blocked on a full queue.
    pub fn new(filter: ExchangeFilter, shutdown: ShutdownSignal) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: ArcSwap::from_pointee(Vec::new()),
                workers: Mutex::new(HashMap::new()),
                filter,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Producer handle for one Input.
    pub fn sink(&self, input: impl Into<String>, stats: Arc<InputStats>) -> ExchangeSink {
        ExchangeSink {
            emitter: self.clone(),
            input: Arc::from(input.into()),
            stats,
        }
    }

    /// Register an Output and start its delivery worker.
    pub async fn add_output(
        &self,
        output: SharedOutput,
        settings: DeliverySettings,
    ) -> Result<(), ReplayError> {
        self.add_output_with_stats(output, settings, Arc::new(OutputStats::default()))
            .await
    }

    /// Like [`Emitter::add_output`], sharing counters the Output itself updates.
    pub async fn add_output_with_stats(
        &self,
        output: SharedOutput,
        settings: DeliverySettings,
        stats: Arc<OutputStats>,
    ) -> Result<(), ReplayError> {
        let mut workers = self.shared.workers.lock().await;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ReplayError::Configuration(
                "cannot add an output while draining".to_string(),
            ));
        }
        let name = output.name().to_string();
        if workers.contains_key(&name) {
            return Err(ReplayError::Configuration(format!(
                "output {name:?} is already registered"
            )));
        }

        let (tx, rx) = mpsc::channel(settings.buffer_capacity.max(1));
        let slot = Arc::new(OutputSlot {
            name: name.clone(),
            kind: output.kind(),
            tx,
            settings: settings.clone(),
            stats: stats.clone(),
        });
        let worker = Worker::new(output, rx, &settings, stats);
        workers.insert(name.clone(), tokio::spawn(worker.run()));

        let mut next = Vec::clone(&self.shared.registry.load_full());
        next.push(slot);
        self.shared.registry.store(Arc::new(next));

        info!(output = %name, "output registered");
        Ok(())
    }

    /// Unregister an Output. Returns once its queue is drained and it is
    /// closed; `false` if no Output has that name.
    pub async fn remove_output(&self, name: &str) -> bool {
        let handle = {
            let mut workers = self.shared.workers.lock().await;
            let current = self.shared.registry.load_full();
            if !current.iter().any(|slot| slot.name == name) {
                return false;
            }
            let next: Vec<_> = current
                .iter()
                .filter(|slot| slot.name != name)
                .cloned()
                .collect();
            self.shared.registry.store(Arc::new(next));
            workers.remove(name)
        };

        info!(output = %name, "output unregistered, draining");
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(output = %name, error = %e, "delivery worker ended abnormally");
            }
        }
        true
    }

    /// Registered Outputs in registration order.
    pub fn outputs(&self) -> Vec<OutputStatus> {
        self.shared
            .registry
            .load()
            .iter()
            .map(|slot| OutputStatus {
                name: slot.name.clone(),
                kind: slot.kind,
                overload: slot.settings.overload,
                buffer_capacity: slot.settings.buffer_capacity,
                stats: slot.stats.snapshot(),
            })
            .collect()
    }

    /// Counters of the registered Outputs, by name. The counters stay live
    /// after the Output is removed or drained.
    pub fn output_stats(&self) -> Vec<(String, Arc<OutputStats>)> {
        self.shared
            .registry
            .load()
            .iter()
            .map(|slot| (slot.name.clone(), slot.stats.clone()))
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.shared
            .registry
            .load()
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// Stop accepting Outputs, let every worker drain its queue, flush and
    /// close. Workers still busy after `grace` are aborted; their names are
    /// returned.
    pub async fn drain(&self, grace: Duration) -> Vec<String> {
        let mut workers = {
            let mut guard = self.shared.workers.lock().await;
            self.shared.closed.store(true, Ordering::Release);
            self.shared.registry.store(Arc::new(Vec::new()));
            std::mem::take(&mut *guard)
        };
        if workers.is_empty() {
            return Vec::new();
        }

        let pending = futures_util::future::join_all(workers.values_mut());
        match tokio::time::timeout(grace, pending).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "delivery worker ended abnormally");
                    }
                }
                Vec::new()
            }
            Err(_) => {
                let mut aborted = Vec::new();
                for (name, handle) in workers {
                    if !handle.is_finished() {
                        handle.abort();
                        aborted.push(name);
                    }
                }
                warn!(outputs = ?aborted, "shutdown grace elapsed before outputs drained");
                aborted
            }
        }
    }

    async fn emit(&self, stats: &InputStats, input: &str, exchange: CorrelatedExchange) -> usize {
        if !self.shared.filter.accepts(&exchange) {
            stats.filtered.fetch_add(1, Ordering::Relaxed);
            metrics::record_filtered(input);
            debug!(input, exchange = %exchange.id(), "exchange filtered");
            return 0;
        }
        stats.captured.fetch_add(1, Ordering::Relaxed);
        metrics::record_captured(input);

        let exchange: SharedExchange = Arc::new(exchange);
        // Held across awaits, so take an owned snapshot rather than a guard.
        let outputs = self.shared.registry.load_full();
        let mut enqueued = 0;
        for slot in outputs.iter() {
            if self.enqueue(slot, exchange.clone()).await {
                enqueued += 1;
            }
        }
        enqueued
    }

    async fn enqueue(&self, slot: &OutputSlot, exchange: SharedExchange) -> bool {
        let exchange = match slot.tx.try_send(exchange) {
            Ok(()) => return accepted(slot),
            // The worker is gone: the Output was removed after our snapshot.
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(exchange)) => exchange,
        };

        if slot.settings.overload == OverloadPolicy::Drop {
            return overloaded(slot);
        }

        let mut shutdown = self.shared.shutdown.clone();
        tokio::select! {
            sent = slot.tx.send(exchange) => match sent {
                Ok(()) => accepted(slot),
                Err(_) => false,
            },
            _ = shutdown.recv() => overloaded(slot),
        }
    }
}

fn accepted(slot: &OutputSlot) -> bool {
    slot.stats.enqueued.fetch_add(1, Ordering::Relaxed);
    let depth = slot.stats.queued.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::set_queue_depth(&slot.name, depth as usize);
    true
}

fn overloaded(slot: &OutputSlot) -> bool {
    slot.stats.dropped_overload.fetch_add(1, Ordering::Relaxed);
    metrics::record_dropped(&slot.name, reason::OVERLOAD);
    debug!(output = %slot.name, "queue full, exchange dropped");
    false
}

/// An Input's handle on the Emitter.
#[derive(Clone, Debug)]
pub struct ExchangeSink {
    emitter: Emitter,
    input: Arc<str>,
    stats: Arc<InputStats>,
}

impl ExchangeSink {
    /// Filter and fan out one exchange. Returns how many Output queues took it.
    pub async fn emit(&self, exchange: CorrelatedExchange) -> usize {
        self.emitter.emit(&self.stats, &self.input, exchange).await
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn stats(&self) -> &Arc<InputStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::FilterConfig;
    use crate::error::OutputError;
    use crate::lifecycle::shutdown::Shutdown;
    use crate::output::Output;
    use crate::protocol::{Direction, Message, MessageId, StreamId};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct Collect {
        name: String,
        seen: std::sync::Mutex<Vec<MessageId>>,
        gate: Option<Arc<Semaphore>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Output for Collect {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &'static str {
            "collect"
        }

        async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.seen.lock().unwrap().push(exchange.id());
            Ok(())
        }

        async fn close(&self) -> Result<(), OutputError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn collector(name: &str) -> Arc<Collect> {
        Arc::new(Collect {
            name: name.to_string(),
            ..Default::default()
        })
    }

    fn exchange(stream: StreamId, seq: u64, path: &str) -> CorrelatedExchange {
        let request = Message::new(
            MessageId { stream, seq },
            Direction::Request,
            Bytes::from(format!("GET {path} HTTP/1.1\r\nHost: a\r\n\r\n")),
            seq,
        );
        CorrelatedExchange::new(request)
    }

    fn emitter(filter: FilterConfig) -> (Emitter, Shutdown) {
        let shutdown = Shutdown::new();
        let filter = ExchangeFilter::from_config(&filter).unwrap();
        (Emitter::new(filter, shutdown.subscribe()), shutdown)
    }

    #[tokio::test]
    async fn fans_out_in_order_to_every_output() {
        let (emitter, _shutdown) = emitter(FilterConfig::default());
        let a = collector("a");
        let b = collector("b");
        emitter.add_output(a.clone(), DeliverySettings::default()).await.unwrap();
        emitter.add_output(b.clone(), DeliverySettings::default()).await.unwrap();

        let sink = emitter.sink("in", Arc::new(InputStats::default()));
        let stream = StreamId::next();
        for seq in 0..5 {
            assert_eq!(sink.emit(exchange(stream, seq, "/x")).await, 2);
        }
        assert!(emitter.drain(Duration::from_secs(5)).await.is_empty());

        let expected: Vec<_> = (0..5).map(|seq| MessageId { stream, seq }).collect();
        assert_eq!(*a.seen.lock().unwrap(), expected);
        assert_eq!(*b.seen.lock().unwrap(), expected);
        assert!(a.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn filtered_exchanges_reach_no_output() {
        let (emitter, _shutdown) = emitter(FilterConfig {
            allow_url: vec!["^/keep".to_string()],
            ..Default::default()
        });
        let out = collector("out");
        emitter.add_output(out.clone(), DeliverySettings::default()).await.unwrap();

        let stats = Arc::new(InputStats::default());
        let sink = emitter.sink("in", stats.clone());
        let stream = StreamId::next();
        assert_eq!(sink.emit(exchange(stream, 0, "/drop")).await, 0);
        assert_eq!(sink.emit(exchange(stream, 1, "/keep")).await, 1);
        emitter.drain(Duration::from_secs(5)).await;

        assert_eq!(out.seen.lock().unwrap().len(), 1);
        assert_eq!(stats.snapshot().filtered, 1);
        assert_eq!(stats.snapshot().captured, 1);
    }

    #[tokio::test]
    async fn drop_policy_sheds_when_full() {
        let (emitter, _shutdown) = emitter(FilterConfig::default());
        let gate = Arc::new(Semaphore::new(0));
        let slow = Arc::new(Collect {
            name: "slow".to_string(),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let settings = DeliverySettings {
            buffer_capacity: 2,
            overload: OverloadPolicy::Drop,
            ..Default::default()
        };
        emitter.add_output(slow.clone(), settings).await.unwrap();

        let sink = emitter.sink("in", Arc::new(InputStats::default()));
        let stream = StreamId::next();
        // One may be taken by the worker and parked in send; at most 3 fit.
        let mut taken = 0;
        for seq in 0..10 {
            taken += sink.emit(exchange(stream, seq, "/x")).await;
        }
        assert!(taken <= 3);

        let status = &emitter.outputs()[0];
        assert_eq!(status.stats.dropped_overload, 10 - taken as u64);

        gate.add_permits(10);
        emitter.drain(Duration::from_secs(5)).await;
        assert_eq!(slow.seen.lock().unwrap().len(), taken);
    }

    #[tokio::test]
    async fn blocked_producer_released_by_shutdown() {
        let (emitter, shutdown) = emitter(FilterConfig::default());
        let gate = Arc::new(Semaphore::new(0));
        let slow = Arc::new(Collect {
            name: "slow".to_string(),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let settings = DeliverySettings {
            buffer_capacity: 1,
            ..Default::default()
        };
        emitter.add_output(slow, settings).await.unwrap();

        let sink = emitter.sink("in", Arc::new(InputStats::default()));
        let producer = tokio::spawn(async move {
            let stream = StreamId::next();
            let mut taken = 0;
            for seq in 0..5 {
                taken += sink.emit(exchange(stream, seq, "/x")).await;
            }
            taken
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        shutdown.trigger();
        let taken = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(taken < 5);
        gate.add_permits(10);
        emitter.drain(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn removed_output_drains_and_stops_receiving() {
        let (emitter, _shutdown) = emitter(FilterConfig::default());
        let keep = collector("keep");
        let gone = collector("gone");
        emitter.add_output(keep.clone(), DeliverySettings::default()).await.unwrap();
        emitter.add_output(gone.clone(), DeliverySettings::default()).await.unwrap();

        let sink = emitter.sink("in", Arc::new(InputStats::default()));
        let stream = StreamId::next();
        sink.emit(exchange(stream, 0, "/x")).await;
        assert!(emitter.remove_output("gone").await);
        assert!(gone.closed.load(Ordering::SeqCst));
        assert!(!emitter.remove_output("gone").await);

        sink.emit(exchange(stream, 1, "/x")).await;
        emitter.drain(Duration::from_secs(5)).await;

        assert_eq!(gone.seen.lock().unwrap().len(), 1);
        assert_eq!(keep.seen.lock().unwrap().len(), 2);
        assert_eq!(emitter.output_names(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let (emitter, _shutdown) = emitter(FilterConfig::default());
        emitter.add_output(collector("x"), DeliverySettings::default()).await.unwrap();
        let err = emitter
            .add_output(collector("x"), DeliverySettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Configuration(_)));
    }

    #[tokio::test]
    async fn drain_aborts_stuck_outputs() {
        let (emitter, _shutdown) = emitter(FilterConfig::default());
        let stuck = Arc::new(Collect {
            name: "stuck".to_string(),
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        });
        emitter.add_output(stuck, DeliverySettings::default()).await.unwrap();
        let sink = emitter.sink("in", Arc::new(InputStats::default()));
        sink.emit(exchange(StreamId::next(), 0, "/x")).await;

        let aborted = emitter.drain(Duration::from_millis(50)).await;
        assert_eq!(aborted, vec!["stuck".to_string()]);
        assert!(emitter
            .add_output(collector("late"), DeliverySettings::default())
            .await
            .is_err());
    }
}

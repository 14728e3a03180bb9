//! Lifecycle controller.
//!
//! # Responsibilities
//! - Own the Inputs, the Emitter and the shutdown handle of one pipeline
//! - Drive `Initializing → Running → Draining → Stopped`
//! - Apply Output changes from a reloaded configuration
//!
//! # Data Flow
//! ```text
//! run():
//!     spawn one task per Input
//!     wait for: shutdown signal | exit_after deadline | every Input finished
//!               (reloads are applied while waiting)
//!     trigger shutdown → join Inputs (bounded) → Emitter::drain(grace)
//! ```
//!
//! # Design Decisions
//! - The state lives in a `watch` channel so observers never miss the
//!   final transition
//! - An Input that fails to open is logged and reported in the summary; the
//!   other Inputs keep running
//! - Reload only touches Outputs. Inputs, filters and capture bounds are
//!   fixed for the life of the process

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::shutdown::Shutdown;
use super::startup::{output_specs, register_output};
use crate::config::plugin::OutputSpec;
use crate::config::schema::{ProcessConfig, ReplayConfig, RetryConfig};
use crate::emitter::{DeliverySettings, Emitter, OutputStatus};
use crate::error::ReplayError;
use crate::input::SharedInput;
use crate::observability::{InputStats, InputStatsSnapshot, OutputStats, OutputStatsSnapshot};
use crate::output::SharedOutput;
use crate::shaping::ExchangeFilter;

/// Ordered: each state only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

struct InputEntry {
    input: SharedInput,
    stats: Arc<InputStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputStatus {
    pub name: String,
    pub kind: &'static str,
    pub stats: InputStatsSnapshot,
}

/// Point-in-time view served by the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub uptime_secs: u64,
    pub inputs: Vec<InputStatus>,
    pub outputs: Vec<OutputStatus>,
}

/// What happened during [`Pipeline::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Inputs that ended with an error.
    pub inputs_failed: Vec<String>,
    /// Outputs still delivering when the grace period ran out.
    pub outputs_aborted: Vec<String>,
    pub inputs: Vec<(String, InputStatsSnapshot)>,
    pub outputs: Vec<(String, OutputStatsSnapshot)>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.inputs_failed.is_empty() && self.outputs_aborted.is_empty()
    }
}

pub struct Pipeline {
    process: ProcessConfig,
    shutdown: Shutdown,
    emitter: Emitter,
    inputs: Arc<ArcSwap<Vec<Arc<InputEntry>>>>,
    /// Outputs created from configuration, by name; the ones a reload manages.
    configured: HashMap<String, OutputSpec>,
    /// Configuration the pipeline was built from, compared against reloads.
    source: Option<ReplayConfig>,
    state: watch::Sender<PipelineState>,
    started: Instant,
}

impl Pipeline {
    pub fn new(process: ProcessConfig, filter: ExchangeFilter) -> Self {
        let shutdown = Shutdown::new();
        let emitter = Emitter::new(filter, shutdown.subscribe());
        Self {
            process,
            shutdown,
            emitter,
            inputs: Arc::new(ArcSwap::from_pointee(Vec::new())),
            configured: HashMap::new(),
            source: None,
            state: watch::channel(PipelineState::Initializing).0,
            started: Instant::now(),
        }
    }

    pub fn add_input(&mut self, input: SharedInput) -> Result<(), ReplayError> {
        let current = self.inputs.load_full();
        if current.iter().any(|entry| entry.input.name() == input.name()) {
            return Err(ReplayError::Configuration(format!(
                "input {:?} is already registered",
                input.name()
            )));
        }
        let mut next = Vec::clone(&current);
        next.push(Arc::new(InputEntry {
            input,
            stats: Arc::new(InputStats::default()),
        }));
        self.inputs.store(Arc::new(next));
        Ok(())
    }

    pub async fn add_output(
        &mut self,
        output: SharedOutput,
        settings: DeliverySettings,
    ) -> Result<(), ReplayError> {
        self.emitter.add_output(output, settings).await
    }

    pub async fn add_output_with_stats(
        &mut self,
        output: SharedOutput,
        settings: DeliverySettings,
        stats: Arc<OutputStats>,
    ) -> Result<(), ReplayError> {
        self.emitter.add_output_with_stats(output, settings, stats).await
    }

    /// Register an Output built from its configuration section.
    pub async fn add_configured_output(
        &mut self,
        name: String,
        spec: OutputSpec,
        retries: &RetryConfig,
    ) -> Result<(), ReplayError> {
        register_output(&self.emitter, name.clone(), &spec, retries).await?;
        self.configured.insert(name, spec);
        Ok(())
    }

    pub(super) fn track_config(&mut self, config: ReplayConfig) {
        self.source = Some(config);
    }

    /// The shutdown handle every task of this pipeline listens to.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
            emitter: self.emitter.clone(),
            inputs: self.inputs.clone(),
            started: self.started,
        }
    }

    /// Run until shutdown, the `exit_after_secs` deadline, or until every
    /// Input has finished; then drain.
    pub async fn run(
        mut self,
        mut reloads: Option<mpsc::UnboundedReceiver<ReplayConfig>>,
    ) -> Result<RunSummary, ReplayError> {
        let inputs = self.inputs.load_full();
        if inputs.is_empty() || self.emitter.output_names().is_empty() {
            return Err(ReplayError::Configuration(
                "a pipeline needs at least one input and one output".to_string(),
            ));
        }

        let mut summary = RunSummary::default();
        let mut running = JoinSet::new();
        for entry in inputs.iter() {
            let entry = entry.clone();
            let sink = self.emitter.sink(entry.input.name(), entry.stats.clone());
            let signal = self.shutdown.subscribe();
            running.spawn(async move {
                let result = entry.input.run(sink, signal).await;
                (entry.input.name().to_string(), result)
            });
        }
        self.state.send_replace(PipelineState::Running);
        info!(
            inputs = inputs.len(),
            outputs = self.emitter.output_names().len(),
            "pipeline running"
        );

        let deadline = self
            .process
            .exit_after_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = sleep_until(deadline) => {
                    info!("exit_after_secs elapsed");
                    break;
                }
                joined = running.join_next() => match joined {
                    Some(joined) => record_input_exit(joined, &mut summary),
                    None => {
                        info!("every input has finished");
                        break;
                    }
                },
                Some(config) = next_reload(&mut reloads) => self.apply_reload(config).await,
            }
        }

        self.state.send_replace(PipelineState::Draining);
        self.shutdown.trigger();
        // One grace period covers stopping Inputs and draining Outputs.
        let deadline = tokio::time::Instant::now() + self.process.shutdown_grace();
        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = running.join_next().await {
                record_input_exit(joined, &mut summary);
            }
        })
        .await;
        if joined.is_err() {
            warn!(remaining = running.len(), "inputs did not stop within the grace period");
            running.abort_all();
        }

        let outputs = self.emitter.output_stats();
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        summary.outputs_aborted = self.emitter.drain(remaining).await;
        summary.outputs = outputs
            .into_iter()
            .map(|(name, stats)| (name, stats.snapshot()))
            .collect();
        summary.inputs = inputs
            .iter()
            .map(|entry| (entry.input.name().to_string(), entry.stats.snapshot()))
            .collect();

        self.state.send_replace(PipelineState::Stopped);
        info!(
            uptime_secs = self.started.elapsed().as_secs(),
            clean = summary.is_clean(),
            "pipeline stopped"
        );
        Ok(summary)
    }

    async fn apply_reload(&mut self, config: ReplayConfig) {
        if let Some(source) = &self.source {
            if source.inputs != config.inputs
                || source.filters != config.filters
                || source.capture != config.capture
            {
                warn!("input, filter and capture changes need a restart; applying output changes only");
            }
        }
        let desired = match output_specs(&config) {
            Ok(desired) => desired,
            Err(e) => {
                error!(error = %e, "reloaded configuration rejected");
                return;
            }
        };
        let wanted: HashMap<&str, &OutputSpec> =
            desired.iter().map(|(name, spec)| (name.as_str(), spec)).collect();

        let stale: Vec<String> = self
            .configured
            .iter()
            .filter(|(name, spec)| wanted.get(name.as_str()) != Some(spec))
            .map(|(name, _)| name.clone())
            .collect();
        let grace = self.process.shutdown_grace();
        for name in stale {
            self.configured.remove(&name);
            if tokio::time::timeout(grace, self.emitter.remove_output(&name))
                .await
                .is_err()
            {
                warn!(output = %name, "removed output still draining after the grace period");
            }
        }

        for (name, spec) in desired {
            if self.configured.contains_key(&name) {
                continue;
            }
            match register_output(&self.emitter, name.clone(), &spec, &config.retries).await {
                Ok(()) => {
                    self.configured.insert(name, spec);
                }
                Err(e) => error!(output = %name, error = %e, "cannot start reloaded output"),
            }
        }
        info!(outputs = ?self.emitter.output_names(), "configuration reloaded");
        if let Some(source) = &mut self.source {
            source.outputs = config.outputs;
        }
    }
}

fn record_input_exit(
    joined: Result<(String, Result<(), ReplayError>), tokio::task::JoinError>,
    summary: &mut RunSummary,
) {
    match joined {
        Ok((name, Ok(()))) => info!(input = %name, "input finished"),
        Ok((name, Err(e))) => {
            error!(input = %name, error = %e, "input failed");
            summary.inputs_failed.push(name);
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "input task panicked"),
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_reload(
    reloads: &mut Option<mpsc::UnboundedReceiver<ReplayConfig>>,
) -> Option<ReplayConfig> {
    match reloads {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable view of a pipeline for observers (diagnostics, tests).
#[derive(Clone)]
pub struct PipelineHandle {
    state: watch::Receiver<PipelineState>,
    shutdown: Shutdown,
    emitter: Emitter,
    inputs: Arc<ArcSwap<Vec<Arc<InputEntry>>>>,
    started: Instant,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Resolves once the pipeline has reached `state` or moved past it.
    pub async fn wait_for(&mut self, state: PipelineState) -> PipelineState {
        match self.state.wait_for(|current| *current >= state).await {
            Ok(current) => *current,
            Err(_) => PipelineState::Stopped,
        }
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state(),
            uptime_secs: self.started.elapsed().as_secs(),
            inputs: self
                .inputs
                .load()
                .iter()
                .map(|entry| InputStatus {
                    name: entry.input.name().to_string(),
                    kind: entry.input.kind(),
                    stats: entry.stats.snapshot(),
                })
                .collect(),
            outputs: self.emitter.outputs(),
        }
    }
}

//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn the raw `[[input]]` / `[[output]]` tables into typed specs
//! - Instantiate Outputs and register them with the Emitter
//! - Instantiate Inputs (nothing is opened until the controller runs them)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Outputs are built before Inputs; a recorder that cannot open its file
//!   stops the process before any traffic is captured

use std::sync::Arc;

use tracing::info;

use super::controller::Pipeline;
use crate::config::plugin::{parse_input, parse_output, InputSpec, OutputSpec};
use crate::config::schema::{ReplayConfig, RetryConfig};
use crate::emitter::Emitter;
use crate::error::ReplayError;
use crate::input::build_input;
use crate::observability::OutputStats;
use crate::output::build_output;
use crate::shaping::ExchangeFilter;

/// Typed `[[input]]` sections with their effective names.
pub fn input_specs(config: &ReplayConfig) -> Result<Vec<(String, InputSpec)>, ReplayError> {
    config
        .inputs
        .iter()
        .enumerate()
        .map(|(index, table)| {
            let spec = parse_input(table)
                .map_err(|e| ReplayError::Configuration(format!("input[{index}]: {e}")))?;
            Ok((spec.name(index), spec))
        })
        .collect()
}

/// Typed `[[output]]` sections with their effective names.
pub fn output_specs(config: &ReplayConfig) -> Result<Vec<(String, OutputSpec)>, ReplayError> {
    config
        .outputs
        .iter()
        .enumerate()
        .map(|(index, table)| {
            let spec = parse_output(table)
                .map_err(|e| ReplayError::Configuration(format!("output[{index}]: {e}")))?;
            Ok((spec.name(index), spec))
        })
        .collect()
}

/// Build one Output and start its delivery worker.
pub async fn register_output(
    emitter: &Emitter,
    name: String,
    spec: &OutputSpec,
    retries: &RetryConfig,
) -> Result<(), ReplayError> {
    let stats = Arc::new(OutputStats::default());
    let output = build_output(spec, name, stats.clone()).await?;
    emitter
        .add_output_with_stats(output, spec.delivery(retries), stats)
        .await
}

/// Instantiate every plugin of a validated configuration.
pub async fn build_pipeline(config: ReplayConfig) -> Result<Pipeline, ReplayError> {
    let filter = ExchangeFilter::from_config(&config.filters)
        .map_err(|e| ReplayError::Configuration(format!("filters: {e}")))?;
    let inputs = input_specs(&config)?;
    let outputs = output_specs(&config)?;

    let mut pipeline = Pipeline::new(config.process.clone(), filter);
    for (name, spec) in outputs {
        info!(output = %name, kind = spec.kind(), "starting output");
        pipeline.add_configured_output(name, spec, &config.retries).await?;
    }
    for (name, spec) in &inputs {
        info!(input = %name, kind = spec.kind(), "creating input");
        pipeline.add_input(build_input(spec, name.clone(), &config.capture))?;
    }
    pipeline.track_config(config);
    Ok(pipeline)
}

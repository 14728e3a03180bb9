//! Replay destinations.
//!
//! # Responsibilities
//! - Define the [`Output`] contract the Emitter's delivery workers drive
//! - Build Output instances from typed configuration
//!
//! # Design Decisions
//! - One flat implementation per `type`; no inheritance-style layering
//! - Shaping, queuing and retries live in the delivery worker, so an Output
//!   only knows how to send one exchange
//! - `send` takes the exchange by reference: exchanges are shared between
//!   Outputs and never mutated

pub mod http;
pub mod recorder;
pub mod stdout;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::plugin::OutputSpec;
use crate::error::{OutputError, ReplayError};
use crate::observability::OutputStats;
use crate::protocol::CorrelatedExchange;

pub use self::http::HttpOutput;
pub use recorder::RecorderOutput;
pub use stdout::StdoutOutput;

/// A replay sink.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Whether `send` may run concurrently on this instance. When false the
    /// delivery worker serializes calls.
    fn concurrency_safe(&self) -> bool {
        false
    }

    /// Upper bound on concurrent sends when `concurrency_safe` is true.
    fn max_in_flight(&self) -> usize {
        1
    }

    async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError>;

    /// Push buffered data to its destination.
    async fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    /// Release resources. Called once, after the last `send` and `flush`.
    async fn close(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

pub type SharedOutput = Arc<dyn Output>;

/// Instantiate an Output from its configuration.
pub async fn build_output(
    spec: &OutputSpec,
    name: String,
    stats: Arc<OutputStats>,
) -> Result<SharedOutput, ReplayError> {
    let output: SharedOutput = match spec {
        OutputSpec::Http(settings) => Arc::new(HttpOutput::new(name, settings, stats)?),
        OutputSpec::File(settings) => Arc::new(RecorderOutput::open(name, settings).await?),
        OutputSpec::Stdout(settings) => Arc::new(StdoutOutput::new(name, settings.format)),
    };
    Ok(output)
}

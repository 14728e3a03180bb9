//! Capture sources.
//!
//! # Responsibilities
//! - Define the [`Input`] contract the Lifecycle Controller drives
//! - Build Input instances from typed configuration
//!
//! # Design Decisions
//! - `run` is the whole life of an Input: it captures until the shutdown
//!   signal fires or the source is exhausted, then returns `Ok`
//! - Inputs never see Outputs; everything goes through the [`ExchangeSink`]
//! - Failing to open the source is the only error that ends an Input early;
//!   malformed traffic is counted and skipped

pub mod file;
pub mod listen;
pub mod tap;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::plugin::InputSpec;
use crate::config::schema::CaptureConfig;
use crate::emitter::ExchangeSink;
use crate::error::ReplayError;
use crate::lifecycle::shutdown::ShutdownSignal;

pub use file::FileInput;
pub use listen::ListenInput;
pub use tap::TapInput;

/// A traffic source.
#[async_trait]
pub trait Input: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Capture and emit exchanges until `shutdown` fires or the source ends.
    async fn run(&self, sink: ExchangeSink, shutdown: ShutdownSignal) -> Result<(), ReplayError>;
}

pub type SharedInput = Arc<dyn Input>;

/// Instantiate an Input from its configuration. Nothing is opened until `run`.
pub fn build_input(spec: &InputSpec, name: String, capture: &CaptureConfig) -> SharedInput {
    match spec {
        InputSpec::Tap(settings) => Arc::new(TapInput::new(name, settings, capture)),
        InputSpec::File(settings) => Arc::new(FileInput::new(name, settings)),
        InputSpec::Listen(settings) => Arc::new(ListenInput::new(name, settings, capture)),
    }
}

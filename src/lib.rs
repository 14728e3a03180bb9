//! Capture live HTTP traffic and replay it elsewhere.
//!
//! Inputs capture or read exchanges, the Emitter fans them out, Outputs
//! replay, record or print them. The lifecycle controller wires the three
//! together from a TOML configuration.

pub mod config;
pub mod emitter;
pub mod error;
pub mod http;
pub mod input;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod output;
pub mod protocol;
pub mod record;
pub mod resilience;
pub mod shaping;

pub use config::ReplayConfig;
pub use emitter::{Emitter, ExchangeSink};
pub use error::{OutputError, ReplayError};
pub use lifecycle::{build_pipeline, Pipeline, PipelineHandle, PipelineState, Shutdown};

//! Resilience for Output delivery.
//!
//! # Data Flow
//! ```text
//! Output worker:
//!     → Output::send (per-Output timeouts live in the Output)
//!     → On retryable failure: retries.rs (bounded attempts, backoff.rs delays)
//!     → Still failing: dropped and counted as a replay failure
//! ```
//!
//! # Design Decisions
//! - A failing Output never blocks other Outputs; retries run in its own worker
//! - Jittered backoff prevents synchronized retry storms against one target

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::{RetryOutcome, RetryPolicy, Retryable};

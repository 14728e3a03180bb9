//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → typed plugin specs → Inputs, Outputs, Emitter
//!
//! Controller (controller.rs):
//!     Initializing → Running → Draining → Stopped
//!     Running: Input tasks capture, delivery workers replay
//!     Draining: Inputs stop, Emitter drains queues, Outputs flush and close
//!
//! Shutdown (shutdown.rs):
//!     One sticky signal shared by every task
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger shutdown; a second one exits immediately
//! ```
//!
//! # Design Decisions
//! - Ordered startup: Outputs are registered before any Input runs, so the
//!   first captured exchange already has somewhere to go
//! - Ordered shutdown: Inputs first, then queues, then Outputs
//! - Draining is bounded by `shutdown_grace_secs`

pub mod controller;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use controller::{Pipeline, PipelineHandle, PipelineState, PipelineStatus, RunSummary};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::build_pipeline;

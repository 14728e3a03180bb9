//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via metrics)
//!     → stats.rs (in-process atomics per Input / Output)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → diagnostics endpoint: /status, /outputs (stats), /metrics (Prometheus)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments); no recorder installed means no-op
//! - Stats are kept independently of metrics so tests and diagnostics do not
//!   depend on a global recorder

pub mod logging;
pub mod metrics;
pub mod stats;

pub use stats::{InputStats, InputStatsSnapshot, OutputStats, OutputStatsSnapshot};

//! HTTP surfaces of the process itself.
//!
//! # Data Flow
//! ```text
//! diagnostics.rs:
//!     GET /status, /outputs → PipelineHandle (stats snapshots, JSON)
//!     GET /metrics          → Prometheus recorder (text exposition)
//!
//! file_server.rs:
//!     GET /<path> → static files from a directory (file-server subcommand)
//! ```
//!
//! Replay traffic never passes through here; Inputs and Outputs own their
//! sockets.

pub mod diagnostics;
pub mod file_server;

pub use diagnostics::{diagnostics_router, serve_diagnostics};
pub use file_server::{file_server_router, serve_files};

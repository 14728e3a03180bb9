//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, plugin.rs option lists)
//!     → ReplayConfig (validated, immutable)
//!     → lifecycle builds Inputs and Outputs from it
//!
//! With process.watch_config:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → controller applies Output changes through the Emitter
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a reload produces a new value
//! - All fields have defaults to allow minimal configs
//! - Unknown keys are errors, at every level
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod plugin;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use plugin::{InputSpec, OutputSpec};
pub use schema::ReplayConfig;

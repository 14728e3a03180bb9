//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the replay
//! pipeline. All types derive Serde traits for deserialization from TOML.
//! Plugin sections (`[[input]]`, `[[output]]`) stay raw tables here; their
//! options depend on `type` and are checked in [`super::plugin`].

use serde::{Deserialize, Serialize};

use crate::protocol::{AssemblerConfig, CorrelatorConfig, FramerLimits};
use std::time::Duration;

/// One `[[input]]` or `[[output]]` table as written.
pub type PluginTable = toml::Table;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Process lifetime settings.
    pub process: ProcessConfig,

    /// Logging and diagnostics.
    pub observability: ObservabilityConfig,

    /// Framing and correlation bounds shared by capture Inputs.
    pub capture: CaptureConfig,

    /// Retry defaults for Output sends.
    pub retries: RetryConfig,

    /// Global request filters.
    pub filters: FilterConfig,

    /// Traffic sources.
    #[serde(rename = "input")]
    pub inputs: Vec<PluginTable>,

    /// Replay destinations.
    #[serde(rename = "output")]
    pub outputs: Vec<PluginTable>,
}

/// Process lifetime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    /// Stop automatically after this many seconds.
    pub exit_after_secs: Option<u64>,

    /// Upper bound on draining queues and flushing Outputs at shutdown.
    pub shutdown_grace_secs: u64,

    /// Apply Output changes from the config file while running.
    pub watch_config: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            exit_after_secs: None,
            shutdown_grace_secs: 10,
            watch_config: false,
        }
    }
}

impl ProcessConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error, or a full
    /// `EnvFilter` expression). `RUST_LOG` takes precedence.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Bind address of the diagnostics endpoint; disabled when unset.
    pub diagnostics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            diagnostics_address: None,
        }
    }
}

/// Bounds for framing and correlation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// A request without response for this long is orphaned.
    pub correlation_timeout_secs: u64,

    /// Unmatched requests kept per stream.
    pub max_pending_per_stream: usize,

    /// Live streams tracked per Input.
    pub max_streams: usize,

    /// Streams with no traffic for this long are closed.
    pub stream_idle_timeout_secs: u64,

    pub max_head_bytes: usize,

    pub max_frame_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let assembler = AssemblerConfig::default();
        Self {
            correlation_timeout_secs: assembler.correlator.timeout.as_secs(),
            max_pending_per_stream: assembler.correlator.max_pending,
            max_streams: assembler.max_streams,
            stream_idle_timeout_secs: assembler.idle_timeout.as_secs(),
            max_head_bytes: assembler.limits.max_head_bytes,
            max_frame_bytes: assembler.limits.max_frame_bytes,
        }
    }
}

impl CaptureConfig {
    pub fn assembler(&self) -> AssemblerConfig {
        AssemblerConfig {
            limits: FramerLimits {
                max_head_bytes: self.max_head_bytes,
                max_frame_bytes: self.max_frame_bytes,
            },
            correlator: CorrelatorConfig {
                timeout: Duration::from_secs(self.correlation_timeout_secs),
                max_pending: self.max_pending_per_stream,
            },
            idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
            max_streams: self.max_streams,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total send attempts per exchange, first try included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Request filters; empty lists disable the rule.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Replay only requests whose path matches one of these.
    pub allow_url: Vec<String>,

    /// Never replay requests whose path matches one of these.
    pub disallow_url: Vec<String>,

    /// `Name: regex`; every rule must match.
    pub allow_header: Vec<String>,

    /// `Name: regex`; any match rejects.
    pub disallow_header: Vec<String>,

    /// Allowed methods.
    pub methods: Vec<String>,
}

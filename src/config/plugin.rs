//! Typed plugin options.
//!
//! Every plugin variant declares the exact option names it honors. A table is
//! first checked against that list, so a misspelled option is reported by
//! name, and only then deserialized into the variant's settings struct.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::schema::{PluginTable, RetryConfig};
use crate::emitter::{DeliverySettings, OverloadPolicy};
use crate::resilience::RetryPolicy;
use crate::shaping::RateLimit;

pub const TAP_OPTIONS: &[&str] = &[
    "type",
    "name",
    "listen",
    "upstream",
    "buffer_capacity",
    "connection_timeout_secs",
    "max_connections",
];

pub const FILE_INPUT_OPTIONS: &[&str] = &["type", "name", "path", "speed", "loop"];

pub const LISTEN_OPTIONS: &[&str] = &["type", "name", "listen", "max_connections"];

pub const HTTP_OUTPUT_OPTIONS: &[&str] = &[
    "type",
    "name",
    "target",
    "rate_limit",
    "sample_rate",
    "buffer_capacity",
    "overload",
    "connection_timeout_secs",
    "timeout_secs",
    "max_attempts",
    "workers",
    "track_responses",
    "preserve_host",
];

pub const FILE_OUTPUT_OPTIONS: &[&str] = &[
    "type",
    "name",
    "path",
    "append",
    "sample_rate",
    "rate_limit",
    "buffer_capacity",
    "overload",
    "max_attempts",
];

pub const STDOUT_OPTIONS: &[&str] = &[
    "type",
    "name",
    "format",
    "sample_rate",
    "rate_limit",
    "buffer_capacity",
    "overload",
];

/// Which plugin array a table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginRole {
    Input,
    Output,
}

impl PluginRole {
    pub fn section(&self) -> &'static str {
        match self {
            PluginRole::Input => "input",
            PluginRole::Output => "output",
        }
    }
}

/// Option names honored by `kind` in `role`, or `None` for an unknown type.
pub fn recognized_options(role: PluginRole, kind: &str) -> Option<&'static [&'static str]> {
    match (role, kind) {
        (PluginRole::Input, "tap") => Some(TAP_OPTIONS),
        (PluginRole::Input, "file") => Some(FILE_INPUT_OPTIONS),
        (PluginRole::Input, "listen") => Some(LISTEN_OPTIONS),
        (PluginRole::Output, "http") => Some(HTTP_OUTPUT_OPTIONS),
        (PluginRole::Output, "file") => Some(FILE_OUTPUT_OPTIONS),
        (PluginRole::Output, "stdout") => Some(STDOUT_OPTIONS),
        _ => None,
    }
}

/// Check a table's `type` and option names. Returns every problem found.
pub fn check_options(role: PluginRole, table: &PluginTable) -> Vec<String> {
    let Some(kind) = table.get("type") else {
        return vec!["missing \"type\"".to_string()];
    };
    let Some(kind) = kind.as_str() else {
        return vec!["\"type\" must be a string".to_string()];
    };
    let Some(known) = recognized_options(role, kind) else {
        return vec![format!("unknown {} type {kind:?}", role.section())];
    };
    table
        .keys()
        .filter(|key| !known.contains(&key.as_str()))
        .map(|key| format!("unknown option {key:?} for {} type {kind:?}", role.section()))
        .collect()
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_connection_timeout_secs() -> u64 {
    5
}

fn default_max_connections() -> usize {
    1024
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_speed() -> f64 {
    1.0
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_workers() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TapSettings {
    pub name: Option<String>,
    pub listen: String,
    pub upstream: String,
    /// Capture events queued between connection tasks and the assembler.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileInputSettings {
    pub name: Option<String>,
    pub path: PathBuf,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default, rename = "loop")]
    pub looping: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ListenSettings {
    pub name: Option<String>,
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputSpec {
    Tap(TapSettings),
    File(FileInputSettings),
    Listen(ListenSettings),
}

impl InputSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            InputSpec::Tap(_) => "tap",
            InputSpec::File(_) => "file",
            InputSpec::Listen(_) => "listen",
        }
    }

    /// Configured name, or `<type>-<index>`.
    pub fn name(&self, index: usize) -> String {
        let explicit = match self {
            InputSpec::Tap(s) => &s.name,
            InputSpec::File(s) => &s.name,
            InputSpec::Listen(s) => &s.name,
        };
        explicit
            .clone()
            .unwrap_or_else(|| format!("{}-{index}", self.kind()))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StdoutFormat {
    #[default]
    Summary,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HttpOutputSettings {
    pub name: Option<String>,
    pub target: String,
    pub rate_limit: Option<RateLimit>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overload: OverloadPolicy,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub max_attempts: Option<u32>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub track_responses: bool,
    #[serde(default)]
    pub preserve_host: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecorderSettings {
    pub name: Option<String>,
    pub path: PathBuf,
    #[serde(default)]
    pub append: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    pub rate_limit: Option<RateLimit>,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overload: OverloadPolicy,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StdoutSettings {
    pub name: Option<String>,
    #[serde(default)]
    pub format: StdoutFormat,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    pub rate_limit: Option<RateLimit>,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overload: OverloadPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputSpec {
    Http(HttpOutputSettings),
    File(RecorderSettings),
    Stdout(StdoutSettings),
}

impl OutputSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputSpec::Http(_) => "http",
            OutputSpec::File(_) => "file",
            OutputSpec::Stdout(_) => "stdout",
        }
    }

    /// Configured name, or `<type>-<index>`.
    pub fn name(&self, index: usize) -> String {
        let explicit = match self {
            OutputSpec::Http(s) => &s.name,
            OutputSpec::File(s) => &s.name,
            OutputSpec::Stdout(s) => &s.name,
        };
        explicit
            .clone()
            .unwrap_or_else(|| format!("{}-{index}", self.kind()))
    }

    pub fn sample_rate(&self) -> f64 {
        match self {
            OutputSpec::Http(s) => s.sample_rate,
            OutputSpec::File(s) => s.sample_rate,
            OutputSpec::Stdout(s) => s.sample_rate,
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        match self {
            OutputSpec::Http(s) => s.buffer_capacity,
            OutputSpec::File(s) => s.buffer_capacity,
            OutputSpec::Stdout(s) => s.buffer_capacity,
        }
    }

    /// Queue, shaping and retry settings for this Output's delivery worker.
    pub fn delivery(&self, retries: &RetryConfig) -> DeliverySettings {
        let (rate_limit, overload, max_attempts) = match self {
            OutputSpec::Http(s) => (s.rate_limit, s.overload, s.max_attempts),
            OutputSpec::File(s) => (s.rate_limit, s.overload, s.max_attempts),
            // Writing to stdout either works or the process has bigger problems.
            OutputSpec::Stdout(s) => (s.rate_limit, s.overload, Some(1)),
        };
        DeliverySettings {
            buffer_capacity: self.buffer_capacity(),
            overload,
            sample_rate: self.sample_rate(),
            rate_limit,
            retry: RetryPolicy::from_config(retries, max_attempts),
        }
    }
}

/// Deserialize an `[[input]]` table. Option names must already be checked.
pub fn parse_input(table: &PluginTable) -> Result<InputSpec, String> {
    toml::Value::Table(table.clone())
        .try_into()
        .map_err(|e: toml::de::Error| e.message().to_string())
}

/// Deserialize an `[[output]]` table. Option names must already be checked.
pub fn parse_output(table: &PluginTable) -> Result<OutputSpec, String> {
    toml::Value::Table(table.clone())
        .try_into()
        .map_err(|e: toml::de::Error| e.message().to_string())
}

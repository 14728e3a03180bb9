//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check every plugin table against its variant's option list
//! - Validate value ranges (timeouts > 0, addresses parse, rates in range)
//! - Detect duplicate plugin names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ReplayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use super::plugin::{check_options, parse_input, parse_output, InputSpec, OutputSpec, PluginRole};
use super::schema::{PluginTable, ReplayConfig};
use crate::shaping::ExchangeFilter;

/// One problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Where the problem is, e.g. `output[1].target`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ReplayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.inputs.is_empty() || config.outputs.is_empty() {
        errors.push(ValidationError::new(
            "pipeline",
            "at least one [[input]] and one [[output]] are required",
        ));
    }

    check_observability(config, &mut errors);
    check_capture(config, &mut errors);
    check_retries(config, &mut errors);

    if let Err(e) = ExchangeFilter::from_config(&config.filters) {
        errors.push(ValidationError::new("filters", e.to_string()));
    }

    let mut names = HashSet::new();
    for (index, table) in config.inputs.iter().enumerate() {
        let path = format!("input[{index}]");
        if let Some(spec) = typed(PluginRole::Input, table, &path, &mut errors, parse_input) {
            check_input(&spec, &path, &mut errors);
            let name = spec.name(index);
            if !names.insert(name.clone()) {
                errors.push(ValidationError::new(&path, format!("duplicate input name {name:?}")));
            }
        }
    }

    let mut names = HashSet::new();
    for (index, table) in config.outputs.iter().enumerate() {
        let path = format!("output[{index}]");
        if let Some(spec) = typed(PluginRole::Output, table, &path, &mut errors, parse_output) {
            check_output(&spec, &path, &mut errors);
            let name = spec.name(index);
            if !names.insert(name.clone()) {
                errors.push(ValidationError::new(&path, format!("duplicate output name {name:?}")));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn typed<T>(
    role: PluginRole,
    table: &PluginTable,
    path: &str,
    errors: &mut Vec<ValidationError>,
    parse: fn(&PluginTable) -> Result<T, String>,
) -> Option<T> {
    let problems = check_options(role, table);
    if !problems.is_empty() {
        errors.extend(problems.into_iter().map(|m| ValidationError::new(path, m)));
        return None;
    }
    match parse(table) {
        Ok(spec) => Some(spec),
        Err(message) => {
            errors.push(ValidationError::new(path, message));
            None
        }
    }
}

fn check_observability(config: &ReplayConfig, errors: &mut Vec<ValidationError>) {
    let obs = &config.observability;
    if tracing_subscriber::EnvFilter::try_new(&obs.log_level).is_err() {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("invalid log filter {:?}", obs.log_level),
        ));
    }
    if let Some(addr) = &obs.diagnostics_address {
        check_socket_addr(addr, "observability.diagnostics_address", errors);
    }
}

fn check_capture(config: &ReplayConfig, errors: &mut Vec<ValidationError>) {
    let capture = &config.capture;
    let positive = [
        ("capture.correlation_timeout_secs", capture.correlation_timeout_secs as usize),
        ("capture.max_pending_per_stream", capture.max_pending_per_stream),
        ("capture.max_streams", capture.max_streams),
        ("capture.stream_idle_timeout_secs", capture.stream_idle_timeout_secs as usize),
        ("capture.max_head_bytes", capture.max_head_bytes),
    ];
    for (path, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(path, "must be greater than 0"));
        }
    }
    if capture.max_frame_bytes < capture.max_head_bytes {
        errors.push(ValidationError::new(
            "capture.max_frame_bytes",
            "must be at least max_head_bytes",
        ));
    }
}

fn check_retries(config: &ReplayConfig, errors: &mut Vec<ValidationError>) {
    let retries = &config.retries;
    if retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be at least 1"));
    }
    if retries.base_delay_ms > retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }
}

fn check_input(spec: &InputSpec, path: &str, errors: &mut Vec<ValidationError>) {
    match spec {
        InputSpec::Tap(s) => {
            check_socket_addr(&s.listen, &format!("{path}.listen"), errors);
            if s.upstream.rsplit_once(':').map_or(true, |(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                errors.push(ValidationError::new(
                    format!("{path}.upstream"),
                    format!("expected host:port, got {:?}", s.upstream),
                ));
            }
            check_positive(s.buffer_capacity, &format!("{path}.buffer_capacity"), errors);
            check_positive(s.max_connections, &format!("{path}.max_connections"), errors);
            check_positive(s.connection_timeout_secs as usize, &format!("{path}.connection_timeout_secs"), errors);
        }
        InputSpec::File(s) => {
            if !(s.speed.is_finite() && s.speed > 0.0) {
                errors.push(ValidationError::new(format!("{path}.speed"), "must be greater than 0"));
            }
            if s.path.as_os_str().is_empty() {
                errors.push(ValidationError::new(format!("{path}.path"), "must not be empty"));
            }
        }
        InputSpec::Listen(s) => {
            check_socket_addr(&s.listen, &format!("{path}.listen"), errors);
            check_positive(s.max_connections, &format!("{path}.max_connections"), errors);
        }
    }
}

fn check_output(spec: &OutputSpec, path: &str, errors: &mut Vec<ValidationError>) {
    let rate = spec.sample_rate();
    if !(0.0..=1.0).contains(&rate) {
        errors.push(ValidationError::new(
            format!("{path}.sample_rate"),
            "must be between 0.0 and 1.0",
        ));
    }
    check_positive(spec.buffer_capacity(), &format!("{path}.buffer_capacity"), errors);

    match spec {
        OutputSpec::Http(s) => {
            match url::Url::parse(&s.target) {
                Ok(url) if matches!(url.scheme(), "http") && url.host_str().is_some() => {}
                Ok(url) => errors.push(ValidationError::new(
                    format!("{path}.target"),
                    format!("unsupported target {url}: expected http://host[:port]"),
                )),
                Err(e) => errors.push(ValidationError::new(
                    format!("{path}.target"),
                    format!("invalid URL {:?}: {e}", s.target),
                )),
            }
            check_positive(s.workers, &format!("{path}.workers"), errors);
            check_positive(s.timeout_secs as usize, &format!("{path}.timeout_secs"), errors);
            check_positive(s.connection_timeout_secs as usize, &format!("{path}.connection_timeout_secs"), errors);
            if s.max_attempts == Some(0) {
                errors.push(ValidationError::new(format!("{path}.max_attempts"), "must be at least 1"));
            }
        }
        OutputSpec::File(s) => {
            if s.path.as_os_str().is_empty() {
                errors.push(ValidationError::new(format!("{path}.path"), "must not be empty"));
            }
            if s.max_attempts == Some(0) {
                errors.push(ValidationError::new(format!("{path}.max_attempts"), "must be at least 1"));
            }
        }
        OutputSpec::Stdout(_) => {}
    }
}

fn check_socket_addr(addr: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if addr.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            path,
            format!("invalid socket address {addr:?}"),
        ));
    }
}

fn check_positive(value: usize, path: &str, errors: &mut Vec<ValidationError>) {
    if value == 0 {
        errors.push(ValidationError::new(path, "must be greater than 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ReplayConfig {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn minimal_config_is_valid() {
        let config = parse(
            r#"
            [[input]]
            type = "tap"
            listen = "127.0.0.1:8080"
            upstream = "127.0.0.1:9000"

            [[output]]
            type = "stdout"
            "#,
        );
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn empty_pipeline_rejected() {
        let errors = validate_config(&ReplayConfig::default()).unwrap_err();
        assert_eq!(errors[0].path, "pipeline");
    }

    #[test]
    fn reports_every_problem() {
        let config = parse(
            r#"
            [observability]
            diagnostics_address = "nowhere"

            [[input]]
            type = "tap"
            listen = "127.0.0.1:8080"
            upstream = "backend"
            buffer_size = 10

            [[output]]
            type = "http"
            target = "ftp://staging"
            sample_rate = 2.0

            [[output]]
            type = "stdout"
            name = "dup"

            [[output]]
            type = "stdout"
            name = "dup"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"observability.diagnostics_address"));
        assert!(errors.iter().any(|e| e.message.contains("buffer_size")));
        assert!(paths.contains(&"output[0].target"));
        assert!(paths.contains(&"output[0].sample_rate"));
        assert!(errors.iter().any(|e| e.message.contains("duplicate output name")));
    }

    #[test]
    fn bad_filter_pattern_reported() {
        let config = parse(
            r#"
            [filters]
            allow_url = ["("]

            [[input]]
            type = "file"
            path = "capture.trpl"

            [[output]]
            type = "stdout"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "filters");
    }
}

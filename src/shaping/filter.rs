//! Request filters applied before fan-out.
//!
//! URL patterns match the request path and query. Header patterns are written
//! `Name: regex` and match the first value of that header.

use regex::Regex;
use thiserror::Error;

use crate::config::schema::FilterConfig;
use crate::protocol::http::parse_request;
use crate::protocol::CorrelatedExchange;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("header filter {0:?} must look like \"Name: regex\"")]
    HeaderSyntax(String),
}

#[derive(Debug, Clone)]
struct HeaderPattern {
    name: String,
    value: Regex,
}

/// Compiled allow/deny rules.
#[derive(Debug, Clone, Default)]
pub struct ExchangeFilter {
    allow_url: Vec<Regex>,
    disallow_url: Vec<Regex>,
    allow_header: Vec<HeaderPattern>,
    disallow_header: Vec<HeaderPattern>,
    methods: Vec<String>,
}

impl ExchangeFilter {
    pub fn from_config(config: &FilterConfig) -> Result<Self, FilterError> {
        Ok(Self {
            allow_url: compile_all(&config.allow_url)?,
            disallow_url: compile_all(&config.disallow_url)?,
            allow_header: config
                .allow_header
                .iter()
                .map(|p| header_pattern(p))
                .collect::<Result<_, _>>()?,
            disallow_header: config
                .disallow_header
                .iter()
                .map(|p| header_pattern(p))
                .collect::<Result<_, _>>()?,
            methods: config.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.allow_url.is_empty()
            && self.disallow_url.is_empty()
            && self.allow_header.is_empty()
            && self.disallow_header.is_empty()
            && self.methods.is_empty()
    }

    /// Whether the exchange should be replayed.
    pub fn accepts(&self, exchange: &CorrelatedExchange) -> bool {
        if self.is_empty() {
            return true;
        }
        let Ok(view) = parse_request(exchange.request().payload()) else {
            return false;
        };

        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == view.method) {
            return false;
        }

        let path = view.path_and_query();
        if !self.allow_url.is_empty() && !self.allow_url.iter().any(|r| r.is_match(path)) {
            return false;
        }
        if self.disallow_url.iter().any(|r| r.is_match(path)) {
            return false;
        }

        let header_matches = |pattern: &HeaderPattern| {
            view.header(&pattern.name)
                .map(String::from_utf8_lossy)
                .is_some_and(|value| pattern.value.is_match(&value))
        };
        if !self.allow_header.iter().all(header_matches) {
            return false;
        }
        !self.disallow_header.iter().any(header_matches)
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, FilterError> {
    patterns.iter().map(|p| compile(p)).collect()
}

fn compile(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|source| FilterError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn header_pattern(spec: &str) -> Result<HeaderPattern, FilterError> {
    let (name, value) = spec
        .split_once(':')
        .ok_or_else(|| FilterError::HeaderSyntax(spec.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(FilterError::HeaderSyntax(spec.to_string()));
    }
    Ok(HeaderPattern {
        name: name.to_string(),
        value: compile(value.trim())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, Message, MessageId, StreamId};
    use bytes::Bytes;

    fn exchange(raw: &'static str) -> CorrelatedExchange {
        CorrelatedExchange::new(Message::new(
            MessageId::new(StreamId::from_raw(1), 0),
            Direction::Request,
            Bytes::from_static(raw.as_bytes()),
            0,
        ))
    }

    fn filter(config: FilterConfig) -> ExchangeFilter {
        ExchangeFilter::from_config(&config).unwrap()
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let f = ExchangeFilter::default();
        assert!(f.accepts(&exchange("not even http")));
    }

    #[test]
    fn url_rules() {
        let f = filter(FilterConfig {
            allow_url: vec!["^/api/".into()],
            disallow_url: vec!["/internal".into()],
            ..FilterConfig::default()
        });
        assert!(f.accepts(&exchange("GET /api/items HTTP/1.1\r\n\r\n")));
        assert!(!f.accepts(&exchange("GET /static/a.css HTTP/1.1\r\n\r\n")));
        assert!(!f.accepts(&exchange("GET /api/internal/x HTTP/1.1\r\n\r\n")));
    }

    #[test]
    fn header_and_method_rules() {
        let f = filter(FilterConfig {
            allow_header: vec!["User-Agent: ^Mozilla".into()],
            disallow_header: vec!["X-Debug: .*".into()],
            methods: vec!["get".into()],
            ..FilterConfig::default()
        });
        assert!(f.accepts(&exchange("GET / HTTP/1.1\r\nUser-Agent: Mozilla/5.0\r\n\r\n")));
        assert!(!f.accepts(&exchange("POST / HTTP/1.1\r\nUser-Agent: Mozilla/5.0\r\n\r\n")));
        assert!(!f.accepts(&exchange("GET / HTTP/1.1\r\nUser-Agent: curl\r\n\r\n")));
        assert!(!f.accepts(&exchange(
            "GET / HTTP/1.1\r\nUser-Agent: Mozilla/5.0\r\nX-Debug: 1\r\n\r\n"
        )));
    }

    #[test]
    fn bad_patterns_rejected() {
        let err = ExchangeFilter::from_config(&FilterConfig {
            allow_url: vec!["(".into()],
            ..FilterConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, FilterError::Pattern { .. }));

        let err = ExchangeFilter::from_config(&FilterConfig {
            allow_header: vec!["no-colon".into()],
            ..FilterConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, FilterError::HeaderSyntax(_)));
    }
}

//! HTTP replay Output.
//!
//! # Responsibilities
//! - Rebuild each captured request against the configured target
//! - Issue it through a pooled hyper-util client
//! - Optionally compare the replayed status with the recorded one
//!
//! # Design Decisions
//! - The request is rebuilt from the raw payload, not from a parsed model:
//!   header order, duplicates and the body go out as captured
//! - Hop-by-hop headers describe the captured connection, so they are dropped;
//!   framing headers are regenerated by the client
//! - `Host` is rewritten to the target unless `preserve_host` is set
//! - Transport errors and timeouts are retryable; any HTTP status counts as
//!   delivered, because the target answered

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use bytes::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use url::Url;

use super::Output;
use crate::config::plugin::HttpOutputSettings;
use crate::error::{OutputError, ReplayError};
use crate::observability::OutputStats;
use crate::protocol::http::{decode_chunked, parse_request, response_status, RequestView};
use crate::protocol::CorrelatedExchange;

/// Replayed response bodies are read (so connections can be reused) up to this size.
const MAX_RESPONSE_BODY: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct HttpOutput {
    name: String,
    /// `host[:port]` of the target.
    authority: String,
    client: Client<HttpConnector, Body>,
    timeout: Duration,
    workers: usize,
    track_responses: bool,
    preserve_host: bool,
    stats: Arc<OutputStats>,
}

impl HttpOutput {
    pub fn new(
        name: String,
        settings: &HttpOutputSettings,
        stats: Arc<OutputStats>,
    ) -> Result<Self, ReplayError> {
        let url = Url::parse(&settings.target).map_err(|e| {
            ReplayError::Configuration(format!("output {name}: invalid target {:?}: {e}", settings.target))
        })?;
        if url.scheme() != "http" {
            return Err(ReplayError::Configuration(format!(
                "output {name}: only http:// targets are supported"
            )));
        }
        let host = url.host_str().ok_or_else(|| {
            ReplayError::Configuration(format!("output {name}: target has no host"))
        })?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(settings.connection_timeout_secs)));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.workers)
            .build(connector);

        Ok(Self {
            name,
            authority,
            client,
            timeout: Duration::from_secs(settings.timeout_secs),
            workers: settings.workers.max(1),
            track_responses: settings.track_responses,
            preserve_host: settings.preserve_host,
            stats,
        })
    }

    fn build_request(&self, payload: &Bytes) -> Result<Request<Body>, OutputError> {
        let view = parse_request(payload)
            .map_err(|e| OutputError::Rejected(format!("unparseable request: {e}")))?;
        let method = Method::from_bytes(view.method.as_bytes())
            .map_err(|_| OutputError::Rejected(format!("invalid method {:?}", view.method)))?;
        let uri = format!("http://{}{}", self.authority, view.path_and_query());

        let listed = connection_tokens(&view);
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &view.headers {
            let lower = name.to_ascii_lowercase();
            let skip = HOP_BY_HOP.contains(&lower.as_str())
                || listed.contains(&lower)
                || lower == "content-length"
                || (lower == "host" && !self.preserve_host);
            if !skip {
                builder = builder.header(*name, *value);
            }
        }

        let body = payload.slice(view.body_offset..);
        let body = if view.chunked {
            decode_chunked(&body).map_err(|e| OutputError::Rejected(format!("bad chunked body: {e}")))?
        } else {
            body
        };
        builder
            .body(Body::from(body))
            .map_err(|e| OutputError::Rejected(e.to_string()))
    }
}

/// Header names listed in `Connection`, lowercased.
fn connection_tokens(view: &RequestView<'_>) -> Vec<String> {
    let mut tokens = Vec::new();
    for (name, value) in &view.headers {
        if !name.eq_ignore_ascii_case("connection") {
            continue;
        }
        for token in String::from_utf8_lossy(value).split(',') {
            let token = token.trim();
            if !token.is_empty() {
                tokens.push(token.to_ascii_lowercase());
            }
        }
    }
    tokens
}

#[async_trait]
impl Output for HttpOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    fn max_in_flight(&self) -> usize {
        self.workers
    }

    async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
        let request = self.build_request(exchange.request().payload())?;
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| OutputError::Unavailable(format!("no response within {:?}", self.timeout)))?
            .map_err(|e| OutputError::Unavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let body = Body::new(response.into_body());
        match tokio::time::timeout(self.timeout, axum::body::to_bytes(body, MAX_RESPONSE_BODY)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(output = %self.name, error = %e, "response body not fully read"),
            Err(_) => debug!(output = %self.name, "response body timed out"),
        }

        if self.track_responses {
            let recorded = exchange.response().and_then(|r| response_status(r.payload()));
            if let Some(recorded) = recorded.filter(|recorded| *recorded != status) {
                self.stats.status_mismatches.fetch_add(1, Ordering::Relaxed);
                debug!(
                    output = %self.name,
                    exchange = %exchange.id(),
                    recorded,
                    replayed = status,
                    "replayed status differs"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOutput")
            .field("name", &self.name)
            .field("authority", &self.authority)
            .field("preserve_host", &self.preserve_host)
            .finish()
    }
}

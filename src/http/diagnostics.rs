//! Diagnostics endpoint.
//!
//! # Responsibilities
//! - Report pipeline state and per-Input / per-Output counters as JSON
//! - Render the Prometheus exposition when a recorder is installed
//!
//! # Design Decisions
//! - Read-only: nothing here can change the pipeline
//! - Keeps serving while the pipeline drains and stops once it has stopped,
//!   so the final counters can still be scraped during shutdown

use std::future::Future;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::emitter::OutputStatus;
use crate::lifecycle::{PipelineHandle, PipelineStatus};

#[derive(Clone)]
struct DiagnosticsState {
    pipeline: PipelineHandle,
    metrics: Option<PrometheusHandle>,
}

pub fn diagnostics_router(pipeline: PipelineHandle, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/outputs", get(outputs))
        .route("/metrics", get(render_metrics))
        .with_state(DiagnosticsState { pipeline, metrics })
        .layer(TraceLayer::new_for_http())
}

async fn status(State(state): State<DiagnosticsState>) -> Json<PipelineStatus> {
    Json(state.pipeline.status())
}

async fn outputs(State(state): State<DiagnosticsState>) -> Json<Vec<OutputStatus>> {
    Json(state.pipeline.emitter().outputs())
}

async fn render_metrics(State(state): State<DiagnosticsState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Serve `router` on `listener` until `stop` resolves.
pub async fn serve_diagnostics(
    listener: TcpListener,
    router: Router,
    stop: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "diagnostics endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(stop)
        .await?;
    tracing::info!("diagnostics endpoint stopped");
    Ok(())
}

//! Static file server for the `file-server` subcommand.
//!
//! Handy as a throwaway replay target: point an `http` Output at it and watch
//! the access log.

use std::future::Future;
use std::path::Path;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Every request is logged at INFO; this is the server's access log.
pub fn file_server_router(dir: &Path) -> Router {
    Router::new().fallback_service(ServeDir::new(dir)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Serve `dir` on `listener` until `stop` resolves.
pub async fn serve_files(
    listener: TcpListener,
    dir: &Path,
    stop: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, dir = %dir.display(), "serving files");
    axum::serve(listener, file_server_router(dir))
        .with_graceful_shutdown(stop)
        .await
}

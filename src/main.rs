//! traffic-replay
//!
//! Captures HTTP traffic and replays it against other environments.
//!
//! # Architecture Overview
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────────────┐
//!  │                           TRAFFIC REPLAY                             │
//!  │                                                                      │
//!  │  Inputs                    Emitter                  Outputs          │
//!  │  ┌────────┐                                        ┌──────────┐      │
//!  │  │  tap   │─ assembler ─┐   ┌──────────┐  queue ──▶│   http   │──▶ target
//!  │  └────────┘             ├──▶│ filters  │  queue ──▶│  file    │──▶ recording
//!  │  ┌────────┐             │   │ fan-out  │  queue ──▶│  stdout  │      │
//!  │  │  file  │─────────────┤   └──────────┘           └──────────┘      │
//!  │  └────────┘             │                  (sampling, rate limits,   │
//!  │  ┌────────┐             │                   retries per Output)      │
//!  │  │ listen │─────────────┘                                            │
//!  │  └────────┘                                                          │
//!  │                                                                      │
//!  │  ┌────────────────────────────────────────────────────────────────┐  │
//!  │  │ config (toml, reload) · lifecycle · observability · diagnostics │  │
//!  │  └────────────────────────────────────────────────────────────────┘  │
//!  └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use traffic_replay::config::schema::ObservabilityConfig;
use traffic_replay::config::watcher::ConfigWatcher;
use traffic_replay::config::{load_config, ReplayConfig};
use traffic_replay::http::{diagnostics_router, serve_diagnostics, serve_files};
use traffic_replay::lifecycle::signals::spawn_signal_handler;
use traffic_replay::lifecycle::{build_pipeline, PipelineState, Shutdown};
use traffic_replay::observability::logging::init_logging;
use traffic_replay::observability::metrics::install_recorder;

#[derive(Parser)]
#[command(name = "traffic-replay", version)]
#[command(about = "Capture live HTTP traffic and replay it elsewhere", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds; overrides `process.exit_after_secs`.
    #[arg(long)]
    exit_after_secs: Option<u64>,

    /// Diagnostics endpoint address; overrides `observability.diagnostics_address`.
    #[arg(long)]
    diagnostics: Option<String>,

    /// Log filter; overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured pipeline (default)
    Run,
    /// Serve a directory over HTTP, as a scratch replay target
    FileServer {
        addr: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::FileServer { ref addr, ref dir }) => file_server(&cli, addr, dir).await,
        Some(Command::Run) | None => run(&cli).await,
    }
}

async fn run(cli: &Cli) -> ExitCode {
    let Some(path) = cli.config.as_deref() else {
        eprintln!("traffic-replay: --config is required to run a pipeline");
        return ExitCode::from(2);
    };
    let mut config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("traffic-replay: {}: {e}", path.display());
            return ExitCode::from(2);
        }
    };
    apply_overrides(cli, &mut config);

    if let Err(e) = init_logging(&config.observability, cli.log_level.as_deref()) {
        eprintln!("traffic-replay: cannot initialize logging: {e}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %path.display(), "traffic-replay starting");

    let metrics = match config.observability.diagnostics_address {
        Some(_) => match install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "metrics recorder not installed");
                None
            }
        },
        None => None,
    };

    let diagnostics_address = config.observability.diagnostics_address.clone();
    let baseline = config.process.watch_config.then(|| config.clone());
    let pipeline = match build_pipeline(config).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            if e.is_fatal() {
                eprintln!("traffic-replay: {}: {e}", path.display());
            }
            return ExitCode::from(e.exit_code());
        }
    };
    spawn_signal_handler(pipeline.shutdown());

    let handle = pipeline.handle();
    if let Some(addr) = diagnostics_address {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let router = diagnostics_router(handle.clone(), metrics);
                let mut until = handle.clone();
                tokio::spawn(async move {
                    let stop = async move {
                        until.wait_for(PipelineState::Stopped).await;
                    };
                    if let Err(e) = serve_diagnostics(listener, router, stop).await {
                        tracing::error!(error = %e, "diagnostics endpoint failed");
                    }
                });
            }
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "cannot bind diagnostics endpoint");
                return ExitCode::FAILURE;
            }
        }
    }

    let (_watcher, reloads) = if let Some(baseline) = baseline {
        let (watcher, reloads) = ConfigWatcher::new(path, &baseline);
        match watcher.run() {
            Ok(guard) => (Some(guard), Some(reloads)),
            Err(e) => {
                tracing::warn!(error = %e, "config watcher not started, reload disabled");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    match pipeline.run(reloads).await {
        Ok(summary) => {
            for (name, stats) in &summary.inputs {
                tracing::info!(input = %name, captured = stats.captured, filtered = stats.filtered,
                    framing_errors = stats.framing_errors, orphaned = stats.orphaned, "input totals");
            }
            for (name, stats) in &summary.outputs {
                tracing::info!(output = %name, delivered = stats.delivered, dropped = stats.dropped(),
                    retries = stats.retries, "output totals");
            }
            if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "pipeline failed");
            ExitCode::from(e.exit_code())
        }
    }
}

fn apply_overrides(cli: &Cli, config: &mut ReplayConfig) {
    if let Some(secs) = cli.exit_after_secs {
        config.process.exit_after_secs = Some(secs);
    }
    if let Some(addr) = &cli.diagnostics {
        config.observability.diagnostics_address = Some(addr.clone());
    }
}

async fn file_server(cli: &Cli, addr: &str, dir: &Path) -> ExitCode {
    if let Err(e) = init_logging(&ObservabilityConfig::default(), cli.log_level.as_deref()) {
        eprintln!("traffic-replay: cannot initialize logging: {e}");
    }
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "cannot bind file server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());
    let mut signal = shutdown.subscribe();
    match serve_files(listener, dir, async move { signal.recv().await }).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "file server failed");
            ExitCode::FAILURE
        }
    }
}

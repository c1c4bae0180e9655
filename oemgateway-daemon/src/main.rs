// OEM Gateway - Sensor data relay daemon
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # OEM Gateway daemon
//!
//! Loads a JSON configuration file, builds every listener and buffer, and
//! relays readings until interrupted. The file is re-read every
//! `gateway.reload_interval` seconds; runtime settings and the log level
//! apply live.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! oemgateway --config /etc/oemgateway/oemgateway.json
//!
//! # Refuse to start if any instance is invalid, expose status on port 9100
//! oemgateway --config oemgateway.json --strict --status-port 9100
//! ```

mod logging;
mod metrics;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use logging::LogControl;
use metrics::{encode_metrics, update_from_status};
use oemgateway::{
    ConfigSource, FileConfigSource, Gateway, GatewayError, GatewayStatus, InstancePolicy, LogLevel,
    PluginRegistry,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// OEM Gateway sensor data relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, default_value = "/etc/oemgateway/oemgateway.json")]
    config: String,

    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL), overrides the file at startup
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Refuse to start when any instance is invalid
    #[arg(long)]
    strict: bool,

    /// Serve /health, /status and /metrics on this port
    #[arg(long)]
    status_port: Option<u16>,
}

#[derive(Error, Debug)]
enum DaemonError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Could not open status port {port}: {source}")]
    StatusPort {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log = LogControl::init(args.log_level.unwrap_or_default());

    info!("OEM Gateway v{}", oemgateway::VERSION);

    match run(args, log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, log: LogControl) -> Result<(), DaemonError> {
    let source = Arc::new(FileConfigSource::new(&args.config));
    info!(config = %source.describe(), "Loading configuration");
    let mut document = source.load().await.map_err(GatewayError::from)?;
    if args.strict {
        document.gateway.on_invalid_instance = InstancePolicy::Abort;
    }
    let env_filter = std::env::var_os("RUST_LOG").is_some();
    if let Some(level) = startup_level(args.log_level, document.gateway.loglevel, env_filter) {
        log.set_level(level);
    }

    let registry = PluginRegistry::with_builtins();
    let mut gateway = Gateway::from_config(&registry, &document)?;
    gateway.set_config_source(source);
    gateway.set_log_level_hook(log.hook());
    let gateway = Arc::new(gateway);

    let shutdown = CancellationToken::new();
    let server = match args.status_port {
        Some(port) => Some(serve_status(Arc::clone(&gateway), port, shutdown.clone()).await?),
        None => None,
    };

    tokio::spawn(wait_for_signal(shutdown.clone()));
    gateway.run(shutdown).await;

    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "Status server task failed");
        }
    }
    info!("{}", gateway.status().report());
    Ok(())
}

/// Level from the configuration file to apply at startup
///
/// `--log-level` and `RUST_LOG` both take precedence over the file until the
/// file's level is edited.
fn startup_level(cli: Option<LogLevel>, file: LogLevel, env_filter: bool) -> Option<LogLevel> {
    if cli.is_some() || env_filter {
        None
    } else {
        Some(file)
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested");
    shutdown.cancel();
}

fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(gateway)
}

async fn serve_status(
    gateway: Arc<Gateway>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, DaemonError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| DaemonError::StatusPort { port, source })?;
    info!("Status endpoint: http://{}/status", addr);

    let app = router(gateway);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Status server stopped");
        }
    }))
}

/// Health check handler: 200 while relaying, 503 otherwise.
async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let health = gateway.status().health;
    let code = if health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, format!("{:?}", health))
}

async fn status_handler(State(gateway): State<Arc<Gateway>>) -> Json<GatewayStatus> {
    Json(gateway.status())
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    update_from_status(&gateway.status());
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}

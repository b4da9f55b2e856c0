#![forbid(unsafe_code)]

//! `error-cure` — demo server for the fault reporting stack.
//!
//! Loads configuration, opens the error log, arms the process fault trap,
//! and serves a small axum application whose routes raise every kind of
//! fault. `--simulate` trips the trap on purpose.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use error_cure::config::CureConfig;
use error_cure::handler::GlobalErrorHandler;
use error_cure::server::{self, AppState};
use error_cure::sink::{ErrorLog, FileErrorLog};
use error_cure::trap::{ArmedTrap, FaultTrap};
use error_cure::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Failure to provoke right after the trap is armed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Drill {
    UnobservedRejection,
    UncaughtPanic,
}

#[derive(Debug, Parser)]
#[command(name = "error-cure", about = "Fault reporting demo server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the error log directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Trip the fault trap instead of serving.
    #[arg(long, value_enum)]
    simulate: Option<Drill>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let mut config = match &args.config {
        Some(path) => CureConfig::load(path)?,
        None => CureConfig::default(),
    };
    if let Some(dir) = args.log_dir.clone() {
        config.log_dir = dir;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(log_path = %config.log_path().display(), "error-cure bootstrap");

    let log: Arc<dyn ErrorLog> = Arc::new(FileErrorLog::new(config.log_dir.clone())?);
    let trap = FaultTrap::new(Arc::clone(&log), config.flush_timeout()).arm()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    match args.simulate {
        Some(drill) => runtime.block_on(run_drill(drill, &trap)),
        None => runtime.block_on(run(config, log, trap)),
    }
}

async fn run(config: CureConfig, log: Arc<dyn ErrorLog>, trap: ArmedTrap) -> Result<()> {
    let handler = Arc::new(GlobalErrorHandler::new(log));
    let state = Arc::new(AppState::new(handler, Some(trap)));

    let bind = SocketAddr::from(([127, 0, 0, 1], config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Server(format!("failed to bind {bind}: {err}")))?;

    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(listener, state, server_ct).await {
            error!(%err, "http server failed");
        }
    });

    let signal = shutdown_signal().await;
    info!(signal, "shutdown signal received");
    ct.cancel();

    let _ = server_handle.await;
    info!("error-cure shut down");
    Ok(())
}

async fn run_drill(drill: Drill, trap: &ArmedTrap) -> Result<()> {
    info!(?drill, "running fault trap drill");
    match drill {
        Drill::UnobservedRejection => {
            let _ = trap.spawn_detached("drill", async {
                Err::<(), _>("simulated unobserved rejection")
            });
        }
        Drill::UncaughtPanic => {
            let _ = tokio::task::spawn_blocking(|| panic!("simulated uncaught panic")).await;
        }
    }

    // The trap exits the process; returning means it never tripped.
    tokio::time::sleep(Duration::from_secs(10)).await;
    Err(AppError::Trap(format!("{drill:?} drill did not trip the trap")))
}

/// Wait for SIGINT or SIGTERM and name the signal that arrived.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            name = wait_ctrl_c() => name,
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(err) => {
            warn!(%err, "SIGTERM listener unavailable; waiting for ctrl-c only");
            wait_ctrl_c().await
        }
    }
}

/// Wait for SIGINT.
#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    wait_ctrl_c().await
}

async fn wait_ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        // Without a ctrl-c listener only the trap or SIGTERM can stop us.
        warn!(%err, "ctrl-c listener failed");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

/// Diagnostics go to stderr so they never mix with `error.log` records.
/// Thread names are kept because trapped panics are reported per thread.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"));
    let builder = fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let installed = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("cannot install tracing subscriber: {err}")))
}

//! Replay Agent - session telemetry capture and upload.
//!
//! Runs a capture process for one session, records console and input events
//! next to it, and uploads every artifact to the collection endpoint.
//!
//! # Exit codes
//!
//! - `0`: session completed
//! - `1`: startup failure
//! - `2`: invalid arguments
//!
//! # Environment Variables
//!
//! See the [`config`](replay_agent::config) module for available options.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use replay_agent::{
    prepare_data_dir, Agent, CaptureProcess, Cli, Config, ConsoleInput, DiagnosticLog,
};

/// Time allowed for blocking tasks (the stdin reader) after the session ends.
const RUNTIME_SHUTDOWN_TIMEOUT_SECS: u64 = 1;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(run_agent(config));
    runtime.shutdown_timeout(Duration::from_secs(RUNTIME_SHUTDOWN_TIMEOUT_SECS));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Runs one session from startup to the end of the shutdown sequence.
async fn run_agent(config: Config) -> Result<()> {
    prepare_data_dir(&config).with_context(|| {
        format!(
            "Failed to prepare data directory {}",
            config.data_dir.display()
        )
    })?;

    let diagnostics = DiagnosticLog::open(&config.diagnostic_log_path())
        .context("Failed to open diagnostic log")?;
    init_logging(&diagnostics);

    info!(
        endpoint = %config.endpoint,
        session_id = %config.session_id,
        title = %config.title,
        out_dir = %config.out_dir.display(),
        "Configuration loaded"
    );

    let recorder = CaptureProcess::new(&config.recorder, &config.title, &config.data_dir);
    let console: Option<ConsoleInput> = config
        .console
        .then(|| Box::new(tokio::io::stdin()) as ConsoleInput);

    let mut agent = Agent::start(&config, diagnostics, recorder, console)
        .await
        .context("Startup failed")?;

    agent.run_until(wait_for_shutdown()).await;

    if let Err(e) = agent.shutdown().await {
        // Late failures do not change the exit status; the artifacts that
        // could be uploaded were.
        error!(error = %e, "Shutdown encountered errors");
    }
    Ok(())
}

/// Initializes logging to stderr and to the diagnostic log.
fn init_logging(diagnostics: &DiagnosticLog) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(diagnostics.clone()),
        )
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

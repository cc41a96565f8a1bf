//! `jouled`: the Joule daemon entry point. Loads configuration, connects
//! to the TimescaleDB backend, starts the module supervisor, and serves
//! until a shutdown signal arrives. The HTTP controller surface that
//! normally sits in front of the supervisor and data store (§6) is out
//! of scope for this crate; this binary wires up only the core so the
//! library can be exercised and tested end to end.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use joule::config::{self, JouleConfig};
use joule::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(author, version, about = "Joule process manager and data-pipeline host", long_about = None)]
struct Args {
    /// Path to the daemon's INI configuration file.
    #[arg(short, long, default_value = "/etc/joule/main.conf")]
    config: PathBuf,

    /// Skip startup verification of filesystem/network preconditions
    /// (used by tests that exercise config parsing against a
    /// throwaway environment).
    #[arg(long, default_value_t = false)]
    skip_verify: bool,
}

/// Exit codes per spec §6: 0 success, 1 configuration/connection error,
/// 2 unexpected failure.
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_UNEXPECTED_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let cfg = match config::load(&args.config, !args.skip_verify) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("jouled exiting: {e}");
            ExitCode::from(EXIT_UNEXPECTED_FAILURE)
        }
    }
}

async fn run(cfg: JouleConfig) -> joule::Result<()> {
    info!("starting joule node [{}]", cfg.name);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&format!("postgresql://{}", cfg.database))
        .await?;

    // Module discovery from `cfg.module_directory`/`cfg.stream_directory`
    // is the out-of-scope CLI/config-loading collaborator's job (spec
    // §1); it is expected to construct `joule::module::Module` values and
    // `joule::worker::Worker`s from them before handing a populated
    // `Supervisor` to this loop. Absent that collaborator, this binary
    // starts with an empty supervisor so the core's lifecycle (start,
    // signal handling, graceful stop) can still be exercised end to end.
    let supervisor = std::sync::Arc::new(Supervisor::new(Vec::new()));

    let handles = supervisor.start();
    info!(
        "supervisor started with {} worker(s); insert period {:?}",
        supervisor.workers().len(),
        cfg.insert_period
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping supervisor");
    supervisor.stop(handles).await;
    pool.close().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

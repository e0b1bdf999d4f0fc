//! poolgate — supervisor entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Seed the registry and build the supervisor and gate
//!   6. Spawn signal watcher (SIGINT / SIGTERM / SIGHUP → shutdown)
//!   7. Start the stdio adapter
//!   8. Wait for shutdown, stop every backend, clean up

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use poolgate::backend::KindFactory;
use poolgate::error::AppError;
use poolgate::gate::AccessGate;
use poolgate::registry::{MemoryRegistry, Table};
use poolgate::supervisor::{self, Supervisor};
use poolgate::{config, logger};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();

    logger::init(effective_log_level, force_cli_level)?;

    info!(
        mux_ep = %config.mux_ep,
        backend = %config.backend.name(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        pools = config.pools.len(),
        "config loaded"
    );

    let store = Arc::new(MemoryRegistry::new());
    store.seed(&config.pools).await;
    let table = Table::new(store, config.registry.op_timeout);

    let factory = Arc::new(KindFactory::new(
        config.backend,
        config.minio.clone(),
        config.rclone.clone(),
        config.manager.command_timeout,
    ));

    // Shared shutdown token: signals and fatal errors cancel it.
    let shutdown = CancellationToken::new();

    let supervisor = Supervisor::new(
        table,
        factory,
        config.manager.clone(),
        &config.mux_ep,
        shutdown.clone(),
    )?;
    let gate = AccessGate::new(supervisor.clone());

    spawn_signal_watcher(shutdown.clone())?;

    supervisor::adapters::start(gate, supervisor.clone(), shutdown.clone(), config.stdio_control);

    info!(
        pid = std::process::id(),
        ports = %format!("{}-{}", config.manager.port_min, config.manager.port_max),
        "supervisor ready"
    );

    shutdown.cancelled().await;

    let drained = supervisor.stop_all(config.manager.shutdown_grace).await;
    supervisor.clean_at_exit();
    if !drained {
        terminate_process_group();
    }

    if let Some(reason) = supervisor.fatal_reason() {
        return Err(AppError::Invariant(format!("aborted: {reason}")));
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_watcher(shutdown: CancellationToken) -> Result<(), AppError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received; initiating shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received; initiating shutdown"),
            _ = sighup.recv() => info!("SIGHUP received; initiating shutdown"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Last resort for backends that outlived the grace period. Our own
/// SIGTERM handler is already installed, so this process survives it.
fn terminate_process_group() {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::getpgrp;

    warn!("sending SIGTERM to the process group");
    if let Err(e) = killpg(getpgrp(), Signal::SIGTERM) {
        warn!("killpg failed: {e}");
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: poolgate [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    CliArgs { log_level: logger::level_for_verbosity(verbosity), config_path }
}

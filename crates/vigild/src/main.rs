//! vigild - Scan Orchestration and Triage Daemon
//!
//! Main entry point for the worker binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use vigil_core::Config;
use vigild::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Scan orchestration and triage worker.
#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "Security scan orchestration daemon")]
#[command(version)]
struct Cli {
    /// Config file (key=value format)
    #[arg(long, env = "VIGILD_CONFIG")]
    config: Option<PathBuf>,

    /// State directory override (database, progress channel)
    #[arg(long, env = "VIGILD_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

fn main() {
    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    } else if config.data_dir == Config::default().data_dir {
        // Prefer the per-user state directory when nothing was configured.
        if let Some(dir) = dirs::data_local_dir() {
            config.data_dir = dir.join("vigild");
        }
    }

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                // Set up signal handler for graceful shutdown.
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gradegrid::commander::{Callbacks, Commander};
use gradegrid::config::CommanderConfig;
use gradegrid::shutdown;

#[derive(Parser, Debug)]
#[command(name = "commander")]
#[command(about = "Dispatches grading assignments to connected workers")]
struct Args {
    /// First of the five consecutive ports the fabric binds
    #[arg(long, default_value = "5000")]
    base_port: u16,

    /// Directory with one subdirectory per student submission
    #[arg(long, default_value = "./assignments")]
    test_dir: PathBuf,

    /// Shared grading harness served under the pseudo-key "common"
    #[arg(long, default_value = "./common")]
    common_dir: PathBuf,

    /// Wall-clock budget (seconds) for one command sequence on a worker
    #[arg(long, default_value = "60")]
    test_timeout: u32,

    /// Heartbeat period and per-dispatch deadline (seconds)
    #[arg(long, default_value = "10")]
    client_timeout: u32,

    /// One shell command per line, in execution order
    #[arg(long, default_value = "./commands.txt")]
    command_file: PathBuf,

    /// Where result transcripts are written
    #[arg(long, default_value = "./results")]
    results_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CommanderConfig {
        base_port: args.base_port,
        test_dir: args.test_dir,
        common_dir: args.common_dir,
        test_timeout: args.test_timeout,
        client_timeout: args.client_timeout,
        command_file: args.command_file,
        results_dir: args.results_dir,
    };

    let callbacks = Callbacks {
        on_success: Arc::new(|key| tracing::info!(key = %key, "Assignment graded")),
        on_failure: Arc::new(|key| tracing::warn!(key = %key, "Dispatch failed")),
        on_client_connected: Arc::new(|ip| tracing::info!(ip = %ip, "Worker joined")),
        on_client_timeout: Arc::new(|ip| tracing::warn!(ip = %ip, "Worker lost")),
    };

    let commander = Commander::with_callbacks(config, callbacks).await?;
    let signals = shutdown::shutdown_token();

    tokio::select! {
        result = commander.run() => result?,
        _ = signals.cancelled() => {
            tracing::info!("Interrupted before completion");
        }
    }

    commander.close().await;
    Ok(())
}

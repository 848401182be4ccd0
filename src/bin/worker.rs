use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gradegrid::config::WorkerConfig;
use gradegrid::shutdown;
use gradegrid::worker::{ident, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Pulls grading assignments from a commander and runs them")]
struct Args {
    /// Commander address
    #[arg(long, default_value = "127.0.0.1")]
    remote_ip: String,

    /// Commander base port
    #[arg(long, default_value = "5000")]
    remote_port: u16,

    /// Per-assignment working directories are created under here
    #[arg(long, default_value = "./tests")]
    work_dir: PathBuf,

    /// Echo endpoint used to discover this worker's public address
    #[arg(long, default_value = ident::DEFAULT_ECHO_ENDPOINT)]
    ip_echo_endpoint: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WorkerConfig {
        remote_ip: args.remote_ip,
        remote_port: args.remote_port,
        work_dir: args.work_dir,
        ip_echo_endpoint: args.ip_echo_endpoint,
    };

    let client = WorkerClient::new(config).await?;
    let signals = shutdown::shutdown_token();

    tokio::select! {
        result = client.run() => result?,
        _ = signals.cancelled() => {
            tracing::info!("Interrupted, abandoning in-flight work");
        }
    }

    Ok(())
}

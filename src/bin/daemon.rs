//! penumbrad: hosts one engine instance and serves local clients over
//! a unix socket.

#![cfg(unix)]

use std::path::PathBuf;
use std::process;

use clap::Parser;
use penumbra::daemon::{run, DaemonConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "penumbrad",
    version,
    about = "Serve a penumbra device to local clients over a unix socket"
)]
struct Cli {
    /// Data device holding the formatted store.
    device: PathBuf,

    /// Separate metadata device, when formatted with one.
    #[arg(long)]
    md_device: Option<PathBuf>,

    /// Unix socket path to listen on.
    #[arg(long)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout is reserved for the readiness line.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = DaemonConfig {
        dev_path: cli.device,
        md_dev_path: cli.md_device,
        socket_path: cli.socket,
    };
    if let Err(e) = run(cfg).await {
        eprintln!("penumbrad: {e}");
        process::exit(1);
    }
}

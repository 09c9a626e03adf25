//! skiff daemon entry point.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skiff::{Config, Daemon};

#[derive(Debug, Parser)]
#[command(name = "skiff", about = "Peer-to-peer encrypted folder synchronization")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the data directory holding node key and folder state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the peer listen port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override the control plane listen address.
    #[arg(long)]
    control_listen: Option<SocketAddr>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = Some(data_dir.clone());
    }
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(listen) = args.control_listen {
        config.control.listen = Some(listen);
    }
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let daemon = match Daemon::spawn(config).await {
            Ok(daemon) => daemon,
            Err(err) => {
                error!("startup failed: {err:#}");
                return ExitCode::from(1);
            }
        };
        match daemon.run_until_shutdown().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("daemon failed: {err:#}");
                ExitCode::from(1)
            }
        }
    })
}

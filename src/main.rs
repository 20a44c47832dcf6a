use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dffmpeg_coordinator::config::{self, ENV_DEV};
use dffmpeg_coordinator::node::Coordinator;
use dffmpeg_coordinator::shutdown::install_shutdown_handler;

const EXIT_CONFIG_ERROR: i32 = 64;
const EXIT_INIT_ERROR: i32 = 70;

#[derive(Parser, Debug)]
#[command(name = "dffmpeg-coordinator")]
#[command(about = "Central coordinator for distributed ffmpeg encode jobs")]
struct Args {
    /// Path to the YAML config file (or set DFFMPEG_COORDINATOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Development mode: debug logging, same as DFFMPEG_COORDINATOR_DEV=1
    #[arg(long)]
    dev: bool,

    /// Print version and exit
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.version {
        println!("dffmpeg-coordinator {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if args.dev {
        std::env::set_var(ENV_DEV, "1");
    }

    // CLI flags win over the environment, which wins over the file.
    let mut config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let default_filter = if config.dev { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        host = %config.host,
        port = config.port,
        dev = config.dev,
        "starting dffmpeg coordinator"
    );

    let coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            tracing::error!(error = %e, "coordinator init failed");
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    let shutdown = install_shutdown_handler();
    if let Err(e) = coordinator.run(shutdown).await {
        tracing::error!(error = %e, "coordinator exited with error");
        std::process::exit(EXIT_INIT_ERROR);
    }
}

mod config;
mod handler;
mod listener;
mod signals;
mod spawn;
mod supervisor;
mod worker;

use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;

/// A minimal pre-fork worker-model HTTP server: a master process binds one
/// listening socket and spawns worker processes that all accept from it.
#[derive(Parser, Debug)]
#[command(name = "prefork", version, about)]
struct Cli {
    /// Number of worker processes (overrides config)
    #[arg(short = 'w', long, alias = "worker_count")]
    worker_count: Option<u32>,

    /// Port to listen for requests on (overrides config)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Host to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Enable debug level logs
    #[arg(short = 'd', long)]
    debug: bool,

    /// Config file path
    #[arg(short = 'c', long, default_value = "prefork.toml")]
    config: PathBuf,

    /// Internal: run as a worker on this inherited listener descriptor
    #[arg(long, hide = true)]
    worker_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(cli.worker_count, cli.host.clone(), cli.port);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    match cli.worker_fd {
        Some(fd) => run_worker(fd, &config).await,
        None => run_master(&config).await,
    }
}

/// Master role: bind the listener, install the signal bridge, supervise.
async fn run_master(config: &Config) -> ExitCode {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_count = config.server.worker_count,
        "prefork master starting"
    );

    let bound = match listener::bind(
        &config.server.host,
        config.server.port,
        config.limits.backlog,
    ) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let (events_tx, events_rx) = mpsc::channel(64);
    if let Err(e) = signals::spawn_master_bridge(events_tx.clone()) {
        tracing::error!(error = %e, "failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    supervisor::Supervisor::new(config, bound, events_tx, events_rx)
        .run()
        .await;
    ExitCode::SUCCESS
}

/// Worker role: adopt the inherited socket and run the accept loop.
async fn run_worker(fd: i32, config: &Config) -> ExitCode {
    let listener = match listener::adopt(fd) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(fd, error = %e, "worker failed to adopt listener");
            return ExitCode::FAILURE;
        }
    };
    let shutdown = match signals::worker_shutdown_watch() {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let handler = handler::HelloHandler::new(&config.limits);
    match worker::serve(listener, handler, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker accept loop failed");
            ExitCode::FAILURE
        }
    }
}

mod client;
mod config;
mod error;
mod filters;
mod format;
mod reload;
mod router;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use server::ServerState;

fn print_help() {
    println!(
        "amux {} — Anthropic Messages API reverse proxy

USAGE:
    amux --config <path>

OPTIONS:
    -c, --config <path>    Path to the YAML configuration file (required)
    -h, --help             Show this help message
    -V, --version          Show version information",
        env!("CARGO_PKG_VERSION")
    );
}

fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                } else {
                    eprintln!("error: --config requires a path");
                    std::process::exit(2);
                }
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("amux {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Run 'amux --help' for usage.");
                std::process::exit(2);
            }
        }
        i += 1;
    }

    config_path
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("amux={},warn", log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let Some(config_path) = parse_args() else {
        eprintln!("error: --config <path> is required");
        eprintln!("Run 'amux --help' for usage.");
        std::process::exit(2);
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level);

    let addr: SocketAddr = match config.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let state = Arc::new(ServerState::new(config));

    let watcher = reload::spawn_config_watcher(state.clone(), config_path.clone());

    info!(
        address = %addr,
        config = %config_path.display(),
        "starting amux proxy"
    );
    if let Err(e) = run_server(addr, state).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    watcher.abort();
}

async fn run_server(addr: SocketAddr, state: Arc<ServerState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = result?;
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "connection error");
                    }
                });
            }
        }
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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

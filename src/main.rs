//! capture-proxy binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use capture_proxy::config::ConfigWatcher;
use capture_proxy::lifecycle::signals::shutdown_signal;
use capture_proxy::lifecycle::startup::{load_initial_config, resolve_port};
use capture_proxy::observability::{logging, metrics};
use capture_proxy::{HttpServer, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "capture-proxy", version, about = "Forward HTTP proxy with response capture")]
struct Args {
    /// Configuration file (JSON or TOML), watched for changes.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Listening port when the configuration names none.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logging needs the level from the config, so peek before the subscriber exists.
    let config = match load_initial_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init_logging(None);
            tracing::error!(path = %args.config.display(), error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    logging::init_logging(config.log_level.as_deref());

    tracing::info!("capture-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = config.metrics_address.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(metrics_address = %addr, error = %e, "Failed to parse metrics address"),
        }
    }

    let port = resolve_port(&config, args.port);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Proxy started and listening to port {}", port);

    let (watcher, config_updates) = ConfigWatcher::new(&args.config, Some(config.clone()));
    let _watcher = match watcher.run() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload disabled");
            None
        }
    };

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    shutdown.trigger_on(shutdown_signal());

    let server = HttpServer::new(config);
    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

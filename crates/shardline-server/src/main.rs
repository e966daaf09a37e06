//! # Shardline Server
//!
//! Serves feature lookups from hot-reloaded sharded tables.
//!
//! ## Startup Flow
//!
//! 1. Initialize tracing/logging
//! 2. Parse command-line arguments and load configuration
//! 3. Build the engine and seed the coordination store
//! 4. Start the refresh driver, then the HTTP server
//! 5. On SIGTERM/Ctrl+C stop both, letting the in-flight cycle finish
//!
//! ## Usage
//!
//! ```bash
//! shardline serve --config shardline.yaml
//! shardline serve --port 8080
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shardline_server::{bootstrap, build_router, config, shutdown::ShutdownCoordinator};

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Online feature store serving hot-reloaded sharded tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the refresh driver
    Serve {
        /// Configuration file path
        #[arg(short, long, default_value = "shardline.yaml")]
        config: String,

        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG sets the level, LOG_FORMAT=json|pretty the output shape
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false).with_thread_ids(false))
            .init();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, port, host } => serve(config, host, port).await,
    }
}

async fn serve(config_path: String, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    info!("Loading configuration from: {}", config_path);
    let mut config = config::load(&config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let server = bootstrap(&config)?;
    let shutdown = ShutdownCoordinator::from_env_or(Duration::from_secs(
        config.server.shutdown_grace_secs,
    ));

    let driver = server.coordinator.clone().spawn(shutdown.subscribe());

    let app = build_router(server.state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs.max(1),
        )));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(
        machine_id = %server.coordinator.config().machine_id,
        "Server listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().on_signal())
        .await
        .context("server error")?;

    // covers a server exit that did not come from the signal
    shutdown.shutdown();
    shutdown.drain(driver).await;

    info!("Server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_serve() {
        let cli = Cli::parse_from(["shardline", "serve"]);
        let Commands::Serve { config, port, host } = cli.command;
        assert_eq!(config, "shardline.yaml");
        assert_eq!(port, None);
        assert_eq!(host, None);
    }

    #[test]
    fn test_cli_with_overrides() {
        let cli = Cli::parse_from([
            "shardline", "serve", "--config", "c.yaml", "--port", "9000", "--host", "127.0.0.1",
        ]);
        let Commands::Serve { config, port, host } = cli.command;
        assert_eq!(config, "c.yaml");
        assert_eq!(port, Some(9000));
        assert_eq!(host.as_deref(), Some("127.0.0.1"));
    }
}

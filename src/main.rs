//! HTTP Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use http_mock_server::{MockServer, MockServerConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "http-mock-server",
    about = "Out-of-process HTTP mock server - request journal and ordered expectations",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "http-mock-server.yaml")]
    config: PathBuf,

    /// Host to bind (overrides the configuration file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for any free port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Prefix for mock routes, e.g. "/custom-base-path"
    #[arg(long)]
    base_path: Option<String>,

    /// Instance name, used to tell servers apart in logs
    #[arg(long)]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", include_str!("../config/default-config.yaml"));
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no expectations)");
        MockServerConfig::default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(base_path) = args.base_path {
        config.server.base_path = Some(base_path);
    }
    if let Some(name) = args.name {
        config.server.name = name;
    }

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} expectations defined)",
            config.expectations.len()
        );
        return Ok(());
    }

    let server = MockServer::from_config(config).await?;
    info!(address = %server.local_addr(), "Mock server listening");

    let shutdown = shutdown_signal()?;
    server.run_until(shutdown).await?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        } else {
            std::future::pending::<()>().await;
        }
    })
}

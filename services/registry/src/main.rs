//! `registry-server`: serve an OCI registry from a TOML configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use eyre::WrapErr as _;
use oci_registry::config::RegistryConfig;
use oci_registry::{Registry, RegistryBuilder};
use secret::Secret;
use tracing_subscriber::EnvFilter;

/// Upload token key, used when the configuration file has none.
const SECRET_ENV: &str = "REGISTRY_UPLOAD_SECRET";

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// OCI registry with pull-through caching.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let mut config = match &args.config {
        Some(path) => RegistryConfig::load(path)
            .wrap_err_with(|| format!("loading configuration from {}", path.display()))?,
        None => {
            tracing::warn!("no configuration file given, using defaults");
            RegistryConfig::default()
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if config.upload.secret.is_none() {
        config.upload.secret = Secret::from_env(SECRET_ENV).ok();
    }

    let storage = config
        .storage
        .backend
        .clone()
        .build()
        .await
        .wrap_err("opening storage")?;
    let registry = RegistryBuilder::from_config(&config)
        .storage(storage)
        .build()
        .await
        .wrap_err("starting registry")?;

    if config.gc.enabled {
        tokio::spawn(collect_garbage(registry.clone(), config.gc.sweep_interval));
    }

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.server.listen))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        registries = config.registries.len(),
        "OCI registry listening"
    );

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving")?;

    tracing::info!("waiting for background tasks");
    registry.proxy().tasks().wait_idle().await;
    Ok(())
}

async fn collect_garbage(registry: Registry, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match registry.collect_garbage().await {
            Ok(report) => tracing::info!(?report, "garbage collection finished"),
            Err(error) => tracing::warn!(%error, "garbage collection failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down");
}

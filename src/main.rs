use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::authorizer::Authorizer;
use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig, StoreBackend};
use gatekeeper::credentials::FileCredentialStore;
use gatekeeper::grpc::GrpcServer;
use gatekeeper::ratelimit::RateLimitEngine;
use gatekeeper::store::{CounterStore, InMemoryCounterStore, RedisCounterStore};

/// API key authorization gate with distributed rate limiting.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatekeeperConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Gatekeeper Authorization Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(grpc_addr = %config.server.grpc_addr, store = ?config.store.backend, "Configuration loaded");

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisCounterStore::new(&config.store).context("invalid store configuration")?,
        ),
        StoreBackend::Memory => {
            warn!("Using in-memory counter store; limits are not shared between instances");
            Arc::new(InMemoryCounterStore::new())
        }
    };

    if let Err(e) = store.ping().await {
        // Decisions fail open (or closed) until the store comes back.
        warn!(error = %e, "Counter store is not reachable at startup");
    }

    let engine = Arc::new(RateLimitEngine::new(store, config.rate_limiting.clone()));
    info!(failure_mode = ?engine.policy().failure_mode, "Rate limit engine initialized");

    let credentials = Arc::new(match &config.credentials.path {
        Some(path) => FileCredentialStore::from_file(path)
            .with_context(|| format!("failed to load credentials from {}", path))?,
        None => {
            warn!("No credential file configured; every API key will be rejected");
            FileCredentialStore::from_yaml("api_keys: []")?
        }
    });

    if config.credentials.path.is_some() && config.credentials.reload_interval_secs > 0 {
        spawn_credential_reload(
            credentials.clone(),
            Duration::from_secs(config.credentials.reload_interval_secs),
        );
    }

    let authorizer = Arc::new(Authorizer::new(credentials, engine));
    let grpc_server = GrpcServer::new(config.server.grpc_addr, authorizer);

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Gatekeeper Authorization Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Periodically re-read the credential file so key changes apply without a
/// restart.
fn spawn_credential_reload(store: Arc<FileCredentialStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately; the file was just loaded.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = store.reload() {
                warn!(error = %e, "Failed to reload credentials, keeping previous set");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

//! Floodgate - Admission Control Sidecar
//!
//! CLI entry point for the Floodgate server.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use floodgate::admission::Admission;
use floodgate::clock;
use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig, StoreBackend};
use floodgate::ratelimit::RateLimiterFactory;
use floodgate::server::HttpServer;
use floodgate::store::{CounterStore, MemoryStore, RedisStore};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Circuit breaking and distributed rate limiting")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to serve the HTTP API on
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Counter store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Redis URL, used with `--store redis`
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FloodgateConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }

    init_tracing(&config.logging);

    info!("Starting Floodgate v{}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let clock = clock::system();
    let mut purgeable = Vec::new();

    let shared_store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process counter store; distributed limits apply per instance");
            let store = Arc::new(MemoryStore::with_clock(clock.clone()));
            purgeable.push(store.clone());
            store as Arc<dyn CounterStore>
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", config.store.url))?;
            if let Err(e) = store.ping().await {
                warn!(error = %e, "Redis did not answer PING; rate limiters will fail open");
            }
            Arc::new(store)
        }
    };

    let breakers = config
        .circuit_breaker
        .build_registry(clock.clone())
        .context("Failed to build circuit breakers")?;
    let limiters = RateLimiterFactory::from_settings(
        &config.rate_limiting,
        Some(shared_store),
        clock,
        &config.store.key_prefix,
    )
    .context("Failed to build rate limiters")?;
    purgeable.push(limiters.local_store().clone());

    spawn_purge(purgeable, Duration::from_secs(config.store.purge_interval_secs));

    let admission = Arc::new(Admission::new(Arc::new(limiters), Arc::new(breakers)));
    let server = HttpServer::new(config.server.http_addr, admission);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("floodgate={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
    }
}

/// Periodically drop expired keys from the in-process stores.
fn spawn_purge(stores: Vec<Arc<MemoryStore>>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged: usize = stores.iter().map(|store| store.purge_expired()).sum();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired counter keys");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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

//! Outway Gateway - Entry Point
//!
//! Starts both gateway listeners and the scheduler loops with graceful
//! shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod gateway;
mod models;
mod pool;
mod scheduler;
mod storage;
mod validator;

use config::Config;
use gateway::{HttpGateway, Socks5Gateway};
use models::PoolConfig;
use pool::ProxyPool;
use scheduler::Scheduler;
use storage::JsonFileStore;
use validator::Validator;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Outway Gateway");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Create the pool backed by the JSON store and hydrate it
    let store = Arc::new(JsonFileStore::new(&config.store_path));
    let pool = Arc::new(ProxyPool::with_store(PoolConfig::default(), store));
    if let Err(e) = pool.load_from_store().await {
        warn!("Failed to load proxies from store: {}", e);
    }
    let stats = pool.stats();
    info!(
        total = stats.total_proxies,
        active = stats.active_proxies,
        "Proxy pool ready"
    );

    // Shutdown channel fanned out to every long-lived task
    let (shutdown_tx, _) = watch::channel(false);

    // Scheduler loops
    let validator = Arc::new(Validator::new(pool.clone()));
    let scheduler = Arc::new(Scheduler::new(pool.clone(), validator));

    let health_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            scheduler.run_health_check(shutdown).await;
        })
    };
    let refresh_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            scheduler.run_auto_refresh(shutdown).await;
        })
    };

    // Gateway listeners
    let http_gateway = HttpGateway::new(
        pool.clone(),
        config.http_addr(),
        config.gateway.connect_timeout(),
        config.gateway.request_timeout(),
    );
    let socks5_gateway = Socks5Gateway::new(pool.clone(), config.socks5_addr());

    let http_shutdown = shutdown_tx.subscribe();
    let socks5_shutdown = shutdown_tx.subscribe();

    let http_task = tokio::spawn(async move {
        if let Err(e) = http_gateway.run(http_shutdown).await {
            error!("HTTP gateway error: {}", e);
        }
    });
    let socks5_task = tokio::spawn(async move {
        if let Err(e) = socks5_gateway.run(socks5_shutdown).await {
            error!("SOCKS5 gateway error: {}", e);
        }
    });

    info!(
        "Listeners started - HTTP: {}, SOCKS5: {}",
        config.http_addr(),
        config.socks5_addr()
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(http_task, socks5_task, health_task, refresh_task);

    info!("Outway Gateway stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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

//! Periodic probe scheduling
//!
//! Two independent loops share one sweep implementation: the health-check
//! loop always sweeps, the auto-refresh loop sweeps only while enabled.
//! Intervals are re-read from the pool config before each arm, so a live
//! config update takes effect on the next tick.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::pool::ProxyPool;
use crate::validator::Validator;

pub struct Scheduler {
    pool: Arc<ProxyPool>,
    validator: Arc<Validator>,
}

impl Scheduler {
    pub fn new(pool: Arc<ProxyPool>, validator: Arc<Validator>) -> Self {
        Self { pool, validator }
    }

    /// Health-check loop; runs until the shutdown signal flips.
    pub async fn run_health_check(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.pool.config().check_interval,
            "Health check loop started"
        );

        loop {
            let interval = self.pool.config().check_interval();
            tokio::select! {
                _ = sleep(interval) => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health check loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Auto-refresh loop; re-arms even while refresh is disabled.
    pub async fn run_auto_refresh(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.pool.config().refresh_interval,
            "Auto refresh loop started"
        );

        loop {
            let config = self.pool.config();
            tokio::select! {
                _ = sleep(config.refresh_interval()) => {
                    if self.pool.config().auto_refresh {
                        debug!("Running auto refresh");
                        self.sweep().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Auto refresh loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every registered proxy concurrently and wait for the sweep to
    /// drain, so no record is re-fanned-out while its probe is in flight.
    pub async fn sweep(&self) {
        let entries = self.pool.entries();
        if entries.is_empty() {
            return;
        }

        info!(count = entries.len(), "Probing proxies");

        futures::stream::iter(entries)
            .for_each_concurrent(None, |entry| {
                let validator = self.validator.clone();
                async move {
                    validator.probe(entry).await;
                }
            })
            .await;

        let stats = self.pool.stats();
        info!(
            active = stats.active_proxies,
            total = stats.total_proxies,
            "Sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PoolConfig, ProxyKind, ProxyRecord, ProxyStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    async fn spawn_proxy_stub() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    if stream.read(&mut buf).await.unwrap_or(0) > 0 {
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                            .await;
                    }
                });
            }
        });
        addr
    }

    fn test_pool() -> Arc<ProxyPool> {
        Arc::new(ProxyPool::new(PoolConfig {
            health_check_url: "http://health.invalid/".to_string(),
            timeout: 2,
            ..PoolConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_sweep_probes_every_registered_proxy() {
        let stub = spawn_proxy_stub().await;
        let pool = test_pool();
        let a = pool.register(ProxyRecord::new(
            stub.ip().to_string(),
            stub.port(),
            ProxyKind::Http,
        ));
        let b = pool.register(ProxyRecord::new(
            stub.ip().to_string(),
            stub.port(),
            ProxyKind::Http,
        ));

        let validator = Arc::new(Validator::new(pool.clone()));
        let scheduler = Scheduler::new(pool.clone(), validator);
        scheduler.sweep().await;

        assert_eq!(a.status(), ProxyStatus::Active);
        assert_eq!(b.status(), ProxyStatus::Active);
        assert_eq!(pool.active_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_with_empty_registry_is_noop() {
        let pool = test_pool();
        let validator = Arc::new(Validator::new(pool.clone()));
        let scheduler = Scheduler::new(pool.clone(), validator);
        scheduler.sweep().await;
        assert_eq!(pool.stats().total_proxies, 0);
    }

    #[tokio::test]
    async fn test_loops_observe_shutdown() {
        let pool = test_pool();
        let validator = Arc::new(Validator::new(pool.clone()));
        let scheduler = Arc::new(Scheduler::new(pool, validator));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let health = {
            let scheduler = scheduler.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { scheduler.run_health_check(rx).await })
        };
        let refresh = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_auto_refresh(shutdown_rx).await })
        };

        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            health.await.unwrap();
            refresh.await.unwrap();
        })
        .await
        .expect("loops did not exit after shutdown signal");
    }
}

//! The upstream proxy pool
//!
//! Owns the registry of proxy records, the derived active subset, the
//! rotation cursor, and the aggregate request counters. Every other
//! component observes or mutates proxy state through this type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OutwayError, Result};
use crate::models::{PoolConfig, PoolStats, ProxyRecord, ProxyStatus, RotationMode};
use crate::storage::ProxyStore;

mod entry;
pub use entry::ProxyEntry;

/// State guarded by the pool's single reader/writer lock.
///
/// `active` is a derived view of `registry`: it must be rebuilt after
/// every status mutation and is never written independently.
struct PoolInner {
    registry: HashMap<String, Arc<ProxyEntry>>,
    active: Vec<Arc<ProxyEntry>>,
    config: PoolConfig,
}

pub struct ProxyPool {
    inner: RwLock<PoolInner>,
    /// Sequential-mode cursor; increments without bound, wraps via modulo.
    cursor: AtomicUsize,
    total_requests: AtomicI64,
    success_requests: AtomicI64,
    failed_requests: AtomicI64,
    store: Option<Arc<dyn ProxyStore>>,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                registry: HashMap::new(),
                active: Vec::new(),
                config: config.normalized(),
            }),
            cursor: AtomicUsize::new(0),
            total_requests: AtomicI64::new(0),
            success_requests: AtomicI64::new(0),
            failed_requests: AtomicI64::new(0),
            store: None,
        }
    }

    pub fn with_store(config: PoolConfig, store: Arc<dyn ProxyStore>) -> Self {
        let mut pool = Self::new(config);
        pool.store = Some(store);
        pool
    }

    /// Hydrate the registry and config from the persistence collaborator.
    ///
    /// Called once at startup. Records loaded with status active enter the
    /// active subset immediately.
    pub async fn load_from_store(&self) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let (records, config) = store.load_all().await?;

        let mut inner = self.inner.write();
        if let Some(config) = config {
            inner.config = config.normalized();
        }
        for mut record in records {
            if record.id.is_empty() {
                record.id = Uuid::new_v4().to_string();
            }
            let entry = Arc::new(ProxyEntry::from_record(record));
            inner.registry.insert(entry.id.clone(), entry);
        }
        Self::rebuild_active(&mut inner);
        debug!(
            total = inner.registry.len(),
            active = inner.active.len(),
            "Loaded proxies from store"
        );
        Ok(())
    }

    /// Register an upstream proxy.
    ///
    /// An empty id gets a freshly generated one. Status always starts as
    /// inactive, pending the first probe; the active subset is untouched.
    pub fn register(&self, mut record: ProxyRecord) -> Arc<ProxyEntry> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        record.status = ProxyStatus::Inactive;
        record.created_at = Utc::now();

        let entry = Arc::new(ProxyEntry::from_record(record.clone()));
        {
            let mut inner = self.inner.write();
            inner.registry.insert(entry.id.clone(), entry.clone());
        }
        debug!(proxy_id = %entry.id, endpoint = %entry.endpoint(), "Registered proxy");
        self.persist_save(record);
        entry
    }

    /// Remove a proxy. A no-op for an unknown id.
    pub fn unregister(&self, id: &str) {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.registry.remove(id).is_some();
            if removed {
                Self::rebuild_active(&mut inner);
            }
            removed
        };
        if removed {
            debug!(proxy_id = %id, "Unregistered proxy");
            self.persist_delete(id.to_string());
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyEntry>> {
        self.inner.read().registry.get(id).cloned()
    }

    /// Pick the next proxy from the active subset per the rotation mode.
    pub fn select_next(&self) -> Result<Arc<ProxyEntry>> {
        let inner = self.inner.read();
        if inner.active.is_empty() {
            return Err(OutwayError::NoProxiesAvailable);
        }

        let selected = match inner.config.rotation_mode {
            RotationMode::Sequential => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
                inner.active[idx % inner.active.len()].clone()
            }
            RotationMode::Random => {
                let mut rng = rand::thread_rng();
                inner
                    .active
                    .choose(&mut rng)
                    .cloned()
                    .ok_or(OutwayError::NoProxiesAvailable)?
            }
            RotationMode::LeastUsed => {
                // First encountered wins ties.
                let mut selected = inner.active[0].clone();
                let mut min_usage = selected.usage();
                for entry in inner.active.iter().skip(1) {
                    let usage = entry.usage();
                    if usage < min_usage {
                        min_usage = usage;
                        selected = entry.clone();
                    }
                }
                selected
            }
        };
        Ok(selected)
    }

    /// Count one forwarded connection attempt.
    pub fn note_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that found no proxy to attribute to.
    pub fn note_unavailable(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a forwarded connection.
    ///
    /// A failure can demote the proxy once its fail count reaches the
    /// configured threshold; a success never promotes (promotion is the
    /// validator's job).
    pub fn record_outcome(&self, entry: &Arc<ProxyEntry>, success: bool) {
        if success {
            entry.add_success();
            self.success_requests.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let fails = entry.add_failure();
        self.failed_requests.fetch_add(1, Ordering::Relaxed);

        let threshold = self.inner.read().config.max_fail_count;
        if fails >= threshold && entry.status() == ProxyStatus::Active {
            {
                let mut inner = self.inner.write();
                // Re-check under the write lock; a probe may have intervened.
                if entry.status() == ProxyStatus::Active
                    && entry.fail_count() >= inner.config.max_fail_count
                {
                    entry.set_status(ProxyStatus::Inactive);
                    Self::rebuild_active(&mut inner);
                    warn!(
                        proxy_id = %entry.id,
                        fail_count = entry.fail_count(),
                        "Proxy demoted after repeated forwarding failures"
                    );
                }
            }
            self.persist_save(entry.snapshot());
        }
    }

    /// Mark a probe as in flight.
    ///
    /// The record stays in the active subset until the probe commits, so a
    /// sweep does not empty the pool while every proxy is being checked.
    pub fn begin_check(&self, entry: &Arc<ProxyEntry>) {
        let _inner = self.inner.write();
        entry.set_status(ProxyStatus::Checking);
    }

    /// Commit a probe outcome: metrics, counters, status, subset rebuild.
    ///
    /// This is the only path that promotes a record to active.
    pub fn commit_probe(&self, entry: &Arc<ProxyEntry>, healthy: bool, elapsed_ms: i64) {
        entry.set_probe_metrics(elapsed_ms, Utc::now());
        {
            let mut inner = self.inner.write();
            if healthy {
                entry.add_success();
                entry.set_status(ProxyStatus::Active);
            } else {
                let fails = entry.add_failure();
                if fails >= inner.config.max_fail_count {
                    entry.set_status(ProxyStatus::Inactive);
                }
            }
            Self::rebuild_active(&mut inner);
        }
        self.persist_save(entry.snapshot());
    }

    /// Rebuild the active subset from the registry.
    pub fn recompute_active(&self) {
        let mut inner = self.inner.write();
        Self::rebuild_active(&mut inner);
    }

    fn rebuild_active(inner: &mut PoolInner) {
        inner.active = inner
            .registry
            .values()
            .filter(|entry| entry.status() == ProxyStatus::Active)
            .cloned()
            .collect();
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.read().config.clone()
    }

    /// Replace the pool config, clamping invalid fields at this boundary.
    pub fn set_config(&self, config: PoolConfig) {
        let config = config.normalized();
        {
            self.inner.write().config = config.clone();
        }
        self.persist_config(config);
    }

    /// All registered entries, for sweep fan-out.
    pub fn entries(&self) -> Vec<Arc<ProxyEntry>> {
        self.inner.read().registry.values().cloned().collect()
    }

    /// Serializable view of every registered proxy.
    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        self.inner
            .read()
            .registry
            .values()
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.read();
        PoolStats {
            total_proxies: inner.registry.len(),
            active_proxies: inner.active.len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_requests: self.success_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }

    fn persist_save(&self, record: ProxyRecord) {
        if let Some(store) = &self.store {
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_proxy(&record).await {
                    warn!(proxy_id = %record.id, error = %e, "Failed to persist proxy record");
                }
            });
        }
    }

    fn persist_delete(&self, id: String) {
        if let Some(store) = &self.store {
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.delete_proxy(&id).await {
                    warn!(proxy_id = %id, error = %e, "Failed to delete proxy record");
                }
            });
        }
    }

    fn persist_config(&self, config: PoolConfig) {
        if let Some(store) = &self.store {
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_config(&config).await {
                    warn!(error = %e, "Failed to persist pool config");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyKind;
    use std::collections::HashSet;

    fn test_record(address: &str) -> ProxyRecord {
        ProxyRecord::new(address, 8080, ProxyKind::Http)
    }

    fn pool_with_mode(mode: RotationMode) -> ProxyPool {
        ProxyPool::new(PoolConfig {
            rotation_mode: mode,
            ..PoolConfig::default()
        })
    }

    /// The active subset must always equal the registry filtered on
    /// status == active.
    fn assert_active_invariant(pool: &ProxyPool) {
        let expected: HashSet<String> = pool
            .snapshot()
            .into_iter()
            .filter(|r| r.status == ProxyStatus::Active)
            .map(|r| r.id)
            .collect();
        let actual: HashSet<String> = pool
            .inner
            .read()
            .active
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(actual, expected);
    }

    fn activate(pool: &ProxyPool, entry: &Arc<ProxyEntry>) {
        pool.commit_probe(entry, true, 1);
    }

    #[test]
    fn test_register_generates_unique_ids() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let a = pool.register(test_record("10.0.0.1"));
        let b = pool.register(test_record("10.0.0.2"));
        assert!(!a.id.is_empty());
        assert!(!b.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_register_starts_inactive_and_unselectable() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        assert_eq!(entry.status(), ProxyStatus::Inactive);
        assert!(matches!(
            pool.select_next(),
            Err(OutwayError::NoProxiesAvailable)
        ));
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_unregister_unknown_id_is_noop() {
        let pool = pool_with_mode(RotationMode::Sequential);
        pool.register(test_record("10.0.0.1"));
        pool.unregister("no-such-id");
        assert_eq!(pool.stats().total_proxies, 1);
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_unregister_removes_from_active_subset() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);
        assert_eq!(pool.active_count(), 1);

        pool.unregister(&entry.id);
        assert_eq!(pool.stats().total_proxies, 0);
        assert!(matches!(
            pool.select_next(),
            Err(OutwayError::NoProxiesAvailable)
        ));
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_sequential_selection_is_round_robin() {
        let pool = pool_with_mode(RotationMode::Sequential);
        for i in 0..3 {
            let entry = pool.register(test_record(&format!("10.0.0.{}", i)));
            activate(&pool, &entry);
        }

        let all: HashSet<String> = pool.snapshot().into_iter().map(|r| r.id).collect();

        // Each window of N consecutive selections visits every member once.
        for _ in 0..3 {
            let mut seen = HashSet::new();
            for _ in 0..3 {
                seen.insert(pool.select_next().unwrap().id.clone());
            }
            assert_eq!(seen, all);
        }
    }

    #[test]
    fn test_sequential_selection_single_proxy() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);

        for _ in 0..5 {
            assert_eq!(pool.select_next().unwrap().id, entry.id);
        }
    }

    #[test]
    fn test_random_selection_returns_active_member() {
        let pool = pool_with_mode(RotationMode::Random);
        for i in 0..3 {
            let entry = pool.register(test_record(&format!("10.0.0.{}", i)));
            activate(&pool, &entry);
        }
        let all: HashSet<String> = pool.snapshot().into_iter().map(|r| r.id).collect();

        for _ in 0..20 {
            assert!(all.contains(&pool.select_next().unwrap().id));
        }
    }

    #[test]
    fn test_least_used_selects_minimal_usage() {
        let pool = pool_with_mode(RotationMode::LeastUsed);
        let a = pool.register(test_record("10.0.0.1"));
        let b = pool.register(test_record("10.0.0.2"));
        activate(&pool, &a);
        activate(&pool, &b);

        // Both probed once; load up `a` so `b` has the lower usage.
        pool.record_outcome(&a, true);
        pool.record_outcome(&a, true);

        let selected = pool.select_next().unwrap();
        assert_eq!(selected.id, b.id);
        assert!(selected.usage() <= a.usage());
    }

    #[test]
    fn test_select_next_empty_pool() {
        let pool = pool_with_mode(RotationMode::Sequential);
        assert!(matches!(
            pool.select_next(),
            Err(OutwayError::NoProxiesAvailable)
        ));
    }

    #[test]
    fn test_forwarding_failures_demote_at_threshold() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);
        assert_eq!(entry.fail_count(), 0);

        pool.record_outcome(&entry, false);
        pool.record_outcome(&entry, false);
        assert_eq!(entry.status(), ProxyStatus::Active, "below threshold");

        pool.record_outcome(&entry, false);
        assert_eq!(entry.status(), ProxyStatus::Inactive);
        assert!(matches!(
            pool.select_next(),
            Err(OutwayError::NoProxiesAvailable)
        ));
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_forwarding_success_never_promotes() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));

        pool.record_outcome(&entry, true);
        assert_eq!(entry.status(), ProxyStatus::Inactive);
        assert_eq!(entry.success_count(), 1);
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_probe_commit_promotes_and_resets_failures() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        entry.add_failure();
        entry.add_failure();

        pool.begin_check(&entry);
        assert_eq!(entry.status(), ProxyStatus::Checking);

        pool.commit_probe(&entry, true, 12);
        assert_eq!(entry.status(), ProxyStatus::Active);
        assert_eq!(entry.fail_count(), 0);
        assert_eq!(entry.success_count(), 1);
        assert_eq!(entry.response_time_ms(), 12);
        assert!(entry.last_check().is_some());
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_probe_failure_below_threshold_keeps_checking() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);

        pool.begin_check(&entry);
        pool.commit_probe(&entry, false, 30);

        // Not yet demoted, but out of the active subset until it recovers.
        assert_eq!(entry.status(), ProxyStatus::Checking);
        assert_eq!(pool.active_count(), 0);
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_probe_failure_at_threshold_demotes() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);

        // threshold is 3: two prior failures, the next one demotes
        entry.add_failure();
        entry.add_failure();
        pool.begin_check(&entry);
        pool.commit_probe(&entry, false, 30);

        assert_eq!(entry.status(), ProxyStatus::Inactive);
        assert!(matches!(
            pool.select_next(),
            Err(OutwayError::NoProxiesAvailable)
        ));
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_aggregate_counters() {
        let pool = pool_with_mode(RotationMode::Sequential);
        let entry = pool.register(test_record("10.0.0.1"));
        activate(&pool, &entry);

        pool.note_request();
        pool.record_outcome(&entry, true);
        pool.note_request();
        pool.record_outcome(&entry, false);
        pool.note_unavailable();

        let stats = pool.stats();
        assert_eq!(stats.total_proxies, 1);
        assert_eq!(stats.active_proxies, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.success_requests, 1);
        assert_eq!(stats.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_load_from_store_hydrates_registry_and_subset() {
        use crate::storage::{MemoryStore, ProxyStore};

        let store = Arc::new(MemoryStore::new());
        let mut active = test_record("10.0.0.1");
        active.id = "a".to_string();
        active.status = ProxyStatus::Active;
        let mut inactive = test_record("10.0.0.2");
        inactive.id = "b".to_string();
        store.save_proxy(&active).await.unwrap();
        store.save_proxy(&inactive).await.unwrap();
        store
            .save_config(&PoolConfig {
                rotation_mode: RotationMode::Random,
                ..PoolConfig::default()
            })
            .await
            .unwrap();

        let pool = ProxyPool::with_store(PoolConfig::default(), store);
        pool.load_from_store().await.unwrap();

        assert_eq!(pool.stats().total_proxies, 2);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.config().rotation_mode, RotationMode::Random);
        assert_eq!(pool.select_next().unwrap().id, "a");
        assert_active_invariant(&pool);
    }

    #[test]
    fn test_set_config_clamps_at_boundary() {
        let pool = pool_with_mode(RotationMode::Sequential);
        pool.set_config(PoolConfig {
            check_interval: 0,
            ..PoolConfig::default()
        });
        assert_eq!(pool.config().check_interval, 1);
    }
}

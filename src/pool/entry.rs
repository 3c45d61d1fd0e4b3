use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::{ProxyKind, ProxyRecord, ProxyStatus};

/// Live in-pool representation of one upstream proxy
///
/// Identity fields never change after registration. The counters are
/// plain atomics so the forwarding paths can record outcomes without the
/// pool lock; `status` is an atomic cell that is only ever written while
/// holding the pool's write lock.
pub struct ProxyEntry {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub kind: ProxyKind,
    pub username: Option<String>,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,

    status: AtomicU8,
    success_count: AtomicI64,
    fail_count: AtomicI64,
    response_time_ms: AtomicI64,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

fn status_to_u8(status: ProxyStatus) -> u8 {
    match status {
        ProxyStatus::Active => 0,
        ProxyStatus::Inactive => 1,
        ProxyStatus::Checking => 2,
    }
}

fn status_from_u8(raw: u8) -> ProxyStatus {
    match raw {
        0 => ProxyStatus::Active,
        2 => ProxyStatus::Checking,
        _ => ProxyStatus::Inactive,
    }
}

impl ProxyEntry {
    pub fn from_record(record: ProxyRecord) -> Self {
        Self {
            id: record.id,
            address: record.address,
            port: record.port,
            kind: record.kind,
            username: record.username,
            password: record.password,
            created_at: record.created_at,
            status: AtomicU8::new(status_to_u8(record.status)),
            success_count: AtomicI64::new(record.success_count),
            fail_count: AtomicI64::new(record.fail_count),
            response_time_ms: AtomicI64::new(record.response_time),
            last_check: Mutex::new(record.last_check),
        }
    }

    /// The proxy's own listener endpoint, "host:port".
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn status(&self) -> ProxyStatus {
        status_from_u8(self.status.load(Ordering::Acquire))
    }

    /// Callers must hold the pool's write lock.
    pub(crate) fn set_status(&self, status: ProxyStatus) {
        self.status.store(status_to_u8(status), Ordering::Release);
    }

    pub fn success_count(&self) -> i64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> i64 {
        self.fail_count.load(Ordering::Relaxed)
    }

    /// success + fail, the load metric least-used selection scans for.
    pub fn usage(&self) -> i64 {
        self.success_count() + self.fail_count()
    }

    pub fn response_time_ms(&self) -> i64 {
        self.response_time_ms.load(Ordering::Relaxed)
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock()
    }

    /// Returns the new fail count.
    pub(crate) fn add_failure(&self) -> i64 {
        self.fail_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.fail_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_probe_metrics(&self, elapsed_ms: i64, at: DateTime<Utc>) {
        self.response_time_ms.store(elapsed_ms, Ordering::Relaxed);
        *self.last_check.lock() = Some(at);
    }

    /// Render the entry as its serializable record form.
    pub fn snapshot(&self) -> ProxyRecord {
        ProxyRecord {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            kind: self.kind,
            username: self.username.clone(),
            password: self.password.clone(),
            status: self.status(),
            response_time: self.response_time_ms(),
            success_count: self.success_count(),
            fail_count: self.fail_count(),
            last_check: self.last_check(),
            created_at: self.created_at,
        }
    }
}

//! Persistence collaborator for the pool
//!
//! The core only depends on the [`ProxyStore`] trait; failures are logged
//! by the caller and never block in-memory mutations.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{OutwayError, Result};
use crate::models::{PoolConfig, ProxyRecord};

/// Durable storage for proxy records and the pool config
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Load every record plus the saved config, once at startup.
    async fn load_all(&self) -> Result<(Vec<ProxyRecord>, Option<PoolConfig>)>;

    async fn save_proxy(&self, record: &ProxyRecord) -> Result<()>;

    async fn delete_proxy(&self, id: &str) -> Result<()>;

    async fn save_config(&self, config: &PoolConfig) -> Result<()>;
}

/// In-memory store, used in tests and as the default collaborator
#[derive(Default)]
pub struct MemoryStore {
    proxies: Mutex<HashMap<String, ProxyRecord>>,
    config: Mutex<Option<PoolConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn load_all(&self) -> Result<(Vec<ProxyRecord>, Option<PoolConfig>)> {
        let proxies = self.proxies.lock().values().cloned().collect();
        let config = self.config.lock().clone();
        Ok((proxies, config))
    }

    async fn save_proxy(&self, record: &ProxyRecord) -> Result<()> {
        self.proxies
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_proxy(&self, id: &str) -> Result<()> {
        self.proxies.lock().remove(id);
        Ok(())
    }

    async fn save_config(&self, config: &PoolConfig) -> Result<()> {
        *self.config.lock() = Some(config.clone());
        Ok(())
    }
}

/// On-disk layout of the JSON store: one document holding everything.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    proxies: Vec<ProxyRecord>,
    #[serde(default)]
    config: Option<PoolConfig>,
}

/// Single-file JSON store
///
/// Reads and rewrites the whole document per mutation; the pool calls it
/// from spawned tasks, so slow disks never stall a selection or probe.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles across concurrent save tasks.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_document(&self) -> Result<StoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| OutwayError::Storage(format!("malformed store file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| OutwayError::Storage(format!("serialize failed: {}", e)))?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyStore for JsonFileStore {
    async fn load_all(&self) -> Result<(Vec<ProxyRecord>, Option<PoolConfig>)> {
        let doc = self.read_document().await?;
        Ok((doc.proxies, doc.config))
    }

    async fn save_proxy(&self, record: &ProxyRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        match doc.proxies.iter_mut().find(|p| p.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => doc.proxies.push(record.clone()),
        }
        self.write_document(&doc).await
    }

    async fn delete_proxy(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.proxies.retain(|p| p.id != id);
        self.write_document(&doc).await
    }

    async fn save_config(&self, config: &PoolConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.config = Some(config.clone());
        self.write_document(&doc).await
    }
}

pub mod config;
pub mod proxy;

pub use config::{PoolConfig, PoolStats, RotationMode};
pub use proxy::{ProxyKind, ProxyRecord, ProxyStatus};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Rotation policy for picking the next upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Sequential,
    Random,
    LeastUsed,
}

impl RotationMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "random" => Self::Random,
            "least_used" | "leastused" | "least-used" => Self::LeastUsed,
            _ => Self::Sequential,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
            Self::LeastUsed => "least_used",
        }
    }
}

/// Pool-wide runtime configuration
///
/// Intervals and the failure threshold must stay positive; `normalized`
/// clamps anything else at the write boundary so a bad update can never
/// busy-loop the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub rotation_mode: RotationMode,
    pub health_check_url: String,
    /// Seconds between health-check sweeps
    pub check_interval: i64,
    /// Per-probe timeout in seconds
    pub timeout: i64,
    /// Consecutive probe failures before a proxy is demoted
    pub max_fail_count: i64,
    /// Authentication for the gateway's own listeners
    pub enable_auth: bool,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default)]
    pub auth_password: String,
    pub auto_refresh: bool,
    /// Seconds between auto-refresh sweeps
    pub refresh_interval: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rotation_mode: RotationMode::Sequential,
            health_check_url: "http://www.google.com".to_string(),
            check_interval: 60,
            timeout: 10,
            max_fail_count: 3,
            enable_auth: false,
            auth_username: String::new(),
            auth_password: String::new(),
            auto_refresh: true,
            refresh_interval: 300,
        }
    }
}

impl PoolConfig {
    /// Clamp out-of-range fields to usable values, warning per field.
    pub fn normalized(mut self) -> Self {
        if self.check_interval < 1 {
            warn!(
                check_interval = self.check_interval,
                "check_interval must be positive, clamping to 1s"
            );
            self.check_interval = 1;
        }
        if self.timeout < 1 {
            warn!(timeout = self.timeout, "timeout must be positive, clamping to 1s");
            self.timeout = 1;
        }
        if self.max_fail_count < 1 {
            warn!(
                max_fail_count = self.max_fail_count,
                "max_fail_count must be positive, clamping to 1"
            );
            self.max_fail_count = 1;
        }
        if self.refresh_interval < 1 {
            warn!(
                refresh_interval = self.refresh_interval,
                "refresh_interval must be positive, clamping to 1s"
            );
            self.refresh_interval = 1;
        }
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval as u64)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout as u64)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval as u64)
    }
}

/// Aggregate pool statistics
///
/// Proxy counts are derived from the registry at snapshot time; request
/// counters accumulate for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PoolStats {
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub total_requests: i64,
    pub success_requests: i64,
    pub failed_requests: i64,
}

use std::env;
use std::time::Duration;

use crate::error::{OutwayError, Result};

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    /// Path of the JSON store file
    pub store_path: String,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind the HTTP listener to (default: 0.0.0.0)
    pub http_host: String,
    /// Port for the HTTP listener (default: 8080)
    pub http_port: u16,
    /// Host to bind the SOCKS5 listener to (default: 0.0.0.0)
    pub socks5_host: String,
    /// Port for the SOCKS5 listener (default: 1080)
    pub socks5_port: u16,
    /// Upstream dial timeout in seconds
    pub connect_timeout: u64,
    /// Plain-request forwarding timeout in seconds
    pub request_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            gateway: GatewayConfig {
                http_host: get_env_or("OUTWAY_HTTP_HOST", "0.0.0.0"),
                http_port: get_env_or("OUTWAY_HTTP_PORT", "8080").parse().map_err(|_| {
                    OutwayError::InvalidConfig("OUTWAY_HTTP_PORT must be a valid port number".into())
                })?,
                socks5_host: get_env_or("OUTWAY_SOCKS5_HOST", "0.0.0.0"),
                socks5_port: get_env_or("OUTWAY_SOCKS5_PORT", "1080")
                    .parse()
                    .map_err(|_| {
                        OutwayError::InvalidConfig(
                            "OUTWAY_SOCKS5_PORT must be a valid port number".into(),
                        )
                    })?,
                connect_timeout: get_env_or("OUTWAY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("OUTWAY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
            },
            store_path: get_env_or("OUTWAY_STORE_PATH", "./data/outway.json"),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// The HTTP listener address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.gateway.http_host, self.gateway.http_port)
    }

    /// The SOCKS5 listener address
    pub fn socks5_addr(&self) -> String {
        format!("{}:{}", self.gateway.socks5_host, self.gateway.socks5_port)
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

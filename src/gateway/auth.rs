//! Basic authentication for the gateway's own listeners
//!
//! Built from the pool config at each connection, so live config updates
//! apply without a restart. The HTTP listener validates a header; the
//! SOCKS5 listener validates the credentials from its sub-negotiation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::error::{OutwayError, Result};
use crate::models::PoolConfig;

#[derive(Clone)]
pub struct GatewayAuth {
    enabled: bool,
    username: String,
    password: String,
}

impl GatewayAuth {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            enabled: config.enable_auth,
            username: config.auth_username.clone(),
            password: config.auth_password.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate the Proxy-Authorization header of a parsed request.
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.validate_header(header)
    }

    /// Validate a raw `Proxy-Authorization` header value.
    ///
    /// Used by the CONNECT path, which never goes through hyper.
    pub fn validate_header(&self, header: Option<&str>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let auth_str = header.ok_or(OutwayError::AuthenticationFailed)?;

        let encoded = auth_str
            .strip_prefix("Basic ")
            .ok_or_else(|| {
                warn!("Invalid auth scheme, expected Basic");
                OutwayError::AuthenticationFailed
            })?;

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| OutwayError::AuthenticationFailed)?;
        let credentials =
            String::from_utf8(decoded).map_err(|_| OutwayError::AuthenticationFailed)?;
        let (user, pass) = credentials
            .split_once(':')
            .ok_or(OutwayError::AuthenticationFailed)?;

        if self.check_credentials(user, pass) {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            warn!("Proxy authentication failed for user: {}", user);
            Err(OutwayError::AuthenticationFailed)
        }
    }

    /// Plain credential comparison, for the SOCKS5 sub-negotiation.
    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    /// 407 Proxy Authentication Required challenge.
    pub fn challenge_response<T>(&self) -> Response<T>
    where
        T: Default,
    {
        Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(PROXY_AUTHENTICATE, "Basic realm=\"Proxy\"")
            .body(T::default())
            .unwrap()
    }
}

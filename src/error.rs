use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Outway gateway
#[derive(Error, Debug)]
pub enum OutwayError {
    // Pool errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: String },

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Tunnel errors
    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Authentication errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Outway operations
pub type Result<T> = std::result::Result<T, OutwayError>;

impl OutwayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            OutwayError::InvalidRequest(_)
            | OutwayError::InvalidProxyAddress(_)
            | OutwayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 401/407 handled by the listener directly
            OutwayError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 404 Not Found
            OutwayError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            // 502 Bad Gateway
            OutwayError::ProxyConnectionFailed(_) | OutwayError::ConnectFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            OutwayError::NoProxiesAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            OutwayError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            OutwayError::Io(_) | OutwayError::Http(_) | OutwayError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for OutwayError {
    fn from(err: hyper::Error) -> Self {
        OutwayError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for OutwayError {
    fn from(err: url::ParseError) -> Self {
        OutwayError::InvalidProxyAddress(err.to_string())
    }
}

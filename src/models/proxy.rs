use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyKind::Http),
            "https" => Some(ProxyKind::Https),
            "socks5" => Some(ProxyKind::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyKind::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyKind::Http | ProxyKind::Https)
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health state of an upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Active,
    #[default]
    Inactive,
    Checking,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Active => "active",
            ProxyStatus::Inactive => "inactive",
            ProxyStatus::Checking => "checking",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(ProxyStatus::Active),
            "inactive" => Some(ProxyStatus::Inactive),
            "checking" => Some(ProxyStatus::Checking),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream proxy record
///
/// Identity fields are stable once the record is registered; health and
/// metric fields are written by the validator and the forwarding paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    #[serde(default)]
    pub id: String,
    pub address: String,
    pub port: u16,
    pub kind: ProxyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub status: ProxyStatus,
    /// Last probe latency in milliseconds
    #[serde(default)]
    pub response_time: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub fail_count: i64,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ProxyRecord {
    /// Create a record from its identity fields, pending its first probe.
    pub fn new(address: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        ProxyRecord {
            id: String::new(),
            address: address.into(),
            port,
            kind,
            username: None,
            password: None,
            status: ProxyStatus::Inactive,
            response_time: 0,
            success_count: 0,
            fail_count: 0,
            last_check: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// The proxy's own listener endpoint, "host:port".
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_kind_parsing_and_helpers() {
        assert_eq!(ProxyKind::from_str("HTTP"), Some(ProxyKind::Http));
        assert_eq!(ProxyKind::from_str("https"), Some(ProxyKind::Https));
        assert_eq!(ProxyKind::from_str("SOCKS5"), Some(ProxyKind::Socks5));
        assert_eq!(ProxyKind::from_str("socks4"), None);

        assert!(ProxyKind::Socks5.is_socks());
        assert!(!ProxyKind::Https.is_socks());
        assert!(ProxyKind::Https.is_http());
        assert!(!ProxyKind::Socks5.is_http());

        assert_eq!(ProxyKind::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_proxy_status_parsing() {
        assert_eq!(ProxyStatus::from_str("active"), Some(ProxyStatus::Active));
        assert_eq!(
            ProxyStatus::from_str("INACTIVE"),
            Some(ProxyStatus::Inactive)
        );
        assert_eq!(
            ProxyStatus::from_str("checking"),
            Some(ProxyStatus::Checking)
        );
        assert_eq!(ProxyStatus::from_str("failed"), None);
        assert_eq!(ProxyStatus::default(), ProxyStatus::Inactive);
    }

    #[test]
    fn test_record_defaults_and_endpoint() {
        let record = ProxyRecord::new("10.0.0.1", 3128, ProxyKind::Http);
        assert!(record.id.is_empty());
        assert_eq!(record.status, ProxyStatus::Inactive);
        assert_eq!(record.fail_count, 0);
        assert_eq!(record.endpoint(), "10.0.0.1:3128");

        let with_auth =
            ProxyRecord::new("10.0.0.2", 1080, ProxyKind::Socks5).with_credentials("u", "p");
        assert_eq!(with_auth.username.as_deref(), Some("u"));
        assert_eq!(with_auth.password.as_deref(), Some("p"));
    }

    #[test]
    fn test_record_deserializes_with_minimal_fields() {
        let record: ProxyRecord = serde_json::from_str(
            r#"{"address":"1.2.3.4","port":8080,"kind":"http"}"#,
        )
        .unwrap();
        assert!(record.id.is_empty());
        assert_eq!(record.status, ProxyStatus::Inactive);
        assert_eq!(record.kind, ProxyKind::Http);
        assert!(record.last_check.is_none());
    }
}

//! Dialing targets through upstream proxies
//!
//! One fresh connection per forwarded request; nothing is pooled.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{OutwayError, Result};
use crate::pool::ProxyEntry;

/// Establishes connections through upstream proxies
pub struct UpstreamTransport;

impl UpstreamTransport {
    /// Connect to `target_host:target_port` through the given proxy.
    pub async fn connect(
        proxy: &ProxyEntry,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        if proxy.kind.is_socks() {
            Self::connect_socks5(proxy, target_host, target_port).await
        } else {
            Self::connect_http(proxy, target_host, target_port).await
        }
    }

    /// Establish a tunnel with an HTTP CONNECT handshake.
    async fn connect_http(
        proxy: &ProxyEntry,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!(proxy = %proxy.endpoint(), "Dialing HTTP proxy");

        let mut stream = TcpStream::connect(proxy.endpoint())
            .await
            .map_err(|e| OutwayError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))?;

        let request = Self::build_connect_request(proxy, target_host, target_port);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| OutwayError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e)))?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await.map_err(|e| {
            OutwayError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            return Err(OutwayError::ConnectFailed(
                "proxy closed connection during handshake".to_string(),
            ));
        }

        let response_str = String::from_utf8_lossy(&response[..n]);
        if !response_str.contains("200") {
            return Err(OutwayError::ConnectFailed(format!(
                "proxy returned non-200 response: {}",
                response_str.lines().next().unwrap_or("")
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Build the CONNECT request for the upstream proxy.
    pub fn build_connect_request(
        proxy: &ProxyEntry,
        target_host: &str,
        target_port: u16,
    ) -> String {
        let target = format!("{}:{}", target_host, target_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            let credentials = format!("{}:{}", username, password);
            let encoded = BASE64.encode(credentials.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Connect through a SOCKS5 proxy; domain targets resolve proxy-side.
    async fn connect_socks5(
        proxy: &ProxyEntry,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!(proxy = %proxy.endpoint(), "Dialing SOCKS5 proxy");

        let proxy_addr = proxy.endpoint();
        let target = (target_host, target_port);

        let stream = if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            Socks5Stream::connect_with_password(proxy_addr.as_str(), target, username, password)
                .await
        } else {
            Socks5Stream::connect(proxy_addr.as_str(), target).await
        }
        .map_err(|e| OutwayError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Split host and port from a CONNECT authority; port defaults to 443.
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        if let Some((host, port_str)) = authority.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| OutwayError::InvalidRequest("Invalid port".to_string()))?;
            Ok((host.to_string(), port))
        } else {
            Ok((authority.to_string(), 443))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyKind, ProxyRecord};
    use crate::pool::ProxyEntry;

    fn http_proxy() -> ProxyEntry {
        let mut record = ProxyRecord::new("10.0.0.1", 3128, ProxyKind::Http);
        record.id = "p1".to_string();
        ProxyEntry::from_record(record)
    }

    #[test]
    fn test_build_connect_request_without_auth() {
        let request = UpstreamTransport::build_connect_request(&http_proxy(), "example.com", 443);
        assert_eq!(
            request,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn test_build_connect_request_with_auth() {
        let mut record = ProxyRecord::new("10.0.0.1", 3128, ProxyKind::Http)
            .with_credentials("user", "pass");
        record.id = "p1".to_string();
        let proxy = ProxyEntry::from_record(record);

        let request = UpstreamTransport::build_connect_request(&proxy, "example.com", 443);
        let encoded = BASE64.encode(b"user:pass");
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains(&format!("Proxy-Authorization: Basic {}\r\n", encoded)));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            UpstreamTransport::parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            UpstreamTransport::parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(UpstreamTransport::parse_authority("example.com:notaport").is_err());
    }

    #[tokio::test]
    async fn test_connect_http_rejects_non_200() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let mut record = ProxyRecord::new(addr.ip().to_string(), addr.port(), ProxyKind::Http);
        record.id = "p1".to_string();
        let proxy = ProxyEntry::from_record(record);

        let result = UpstreamTransport::connect(&proxy, "example.com", 443).await;
        assert!(matches!(result, Err(OutwayError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_http_accepts_200_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let mut record = ProxyRecord::new(addr.ip().to_string(), addr.port(), ProxyKind::Http);
        record.id = "p1".to_string();
        let proxy = ProxyEntry::from_record(record);

        assert!(UpstreamTransport::connect(&proxy, "example.com", 443)
            .await
            .is_ok());
    }
}

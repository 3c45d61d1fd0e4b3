//! Health probing of upstream proxies
//!
//! A probe fetches the configured health-check URL through the proxy
//! under test, so it validates both reachability of the proxy and the
//! proxy's ability to reach the outside world. Probe results are the only
//! path that promotes a proxy to active.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};
use url::Url;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{OutwayError, Result};
use crate::gateway::transport::UpstreamTransport;
use crate::pool::{ProxyEntry, ProxyPool};

/// Probes proxies and commits health outcomes into the pool
pub struct Validator {
    pool: Arc<ProxyPool>,
    tls: TlsConnector,
}

impl Validator {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self {
            pool,
            tls: TlsConnector::from(insecure_tls_config()),
        }
    }

    /// Run one probe against the entry and commit the outcome.
    ///
    /// The entry is marked checking for the duration; I/O happens without
    /// any pool lock held, and the result commits in one locked step.
    #[instrument(skip(self, entry), fields(proxy_id = %entry.id, endpoint = %entry.endpoint()))]
    pub async fn probe(&self, entry: Arc<ProxyEntry>) {
        let config = self.pool.config();
        self.pool.begin_check(&entry);

        let started = Instant::now();
        let result = timeout(
            config.probe_timeout(),
            self.fetch_through_proxy(&entry, &config.health_check_url),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let healthy = match result {
            Ok(Ok(status)) if status < 400 => {
                debug!(status, elapsed_ms, "Probe succeeded");
                true
            }
            Ok(Ok(status)) => {
                warn!(status, "Probe returned error status");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Probe failed");
                false
            }
            Err(_) => {
                warn!("Probe timed out");
                false
            }
        };

        self.pool.commit_probe(&entry, healthy, elapsed_ms);
    }

    /// GET the health-check URL with the entry acting as forward proxy.
    ///
    /// Returns the HTTP status code of the response.
    async fn fetch_through_proxy(&self, proxy: &ProxyEntry, raw_url: &str) -> Result<u16> {
        let url = Url::parse(raw_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| OutwayError::InvalidConfig("health check URL has no host".into()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| OutwayError::InvalidConfig("health check URL has no port".into()))?;
        let https = url.scheme() == "https";

        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };

        if proxy.kind.is_http() && !https {
            // Plain-HTTP target: absolute-form GET straight to the proxy.
            let mut builder = Request::builder()
                .method(Method::GET)
                .uri(raw_url)
                .header(HOST, &host_header);
            if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", encoded));
            }
            let request = builder
                .body(Empty::<Bytes>::new())
                .map_err(|e| OutwayError::InvalidRequest(e.to_string()))?;

            let stream = TcpStream::connect(proxy.endpoint()).await.map_err(|e| {
                OutwayError::ProxyConnectionFailed(format!("TCP connect failed: {}", e))
            })?;
            return send_request(stream, request).await;
        }

        // Tunnel to the target (CONNECT or SOCKS5 depending on the kind),
        // then speak origin-form HTTP over it, with TLS when required.
        let stream = UpstreamTransport::connect(proxy, &host, port).await?;

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, &host_header)
            .body(Empty::<Bytes>::new())
            .map_err(|e| OutwayError::InvalidRequest(e.to_string()))?;

        if https {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| OutwayError::InvalidConfig(format!("invalid TLS host: {}", host)))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| OutwayError::ProxyConnectionFailed(format!("TLS failed: {}", e)))?;
            send_request(tls_stream, request).await
        } else {
            send_request(stream, request).await
        }
    }
}

async fn send_request<S>(stream: S, request: Request<Empty<Bytes>>) -> Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| OutwayError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection ended: {}", e);
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| OutwayError::Http(e.to_string()))?;

    Ok(response.status().as_u16())
}

/// Client TLS config with certificate validation relaxed.
///
/// Probe targets are routinely fronted by self-signed or intercepted
/// certificates; the probe only cares whether bytes flow.
fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoCertificateVerification));
    Arc::new(config)
}

#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

//! HTTP forward-proxy listener
//!
//! Each accepted connection is sniffed on its first eight bytes: CONNECT
//! requests are handled raw (the tunnel owns the socket, no further HTTP
//! framing), everything else is served through hyper and forwarded
//! through the selected upstream proxy per its kind.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{OutwayError, Result};
use crate::gateway::auth::GatewayAuth;
use crate::gateway::transport::UpstreamTransport;
use crate::gateway::tunnel;
use crate::pool::{ProxyEntry, ProxyPool};

const MAX_HEAD_BYTES: usize = 8192;

/// The HTTP/HTTPS side of the gateway
pub struct HttpGateway {
    pool: Arc<ProxyPool>,
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpGateway {
    pub fn new(
        pool: Arc<ProxyPool>,
        addr: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            addr,
            connect_timeout,
            request_timeout,
        }
    }

    /// Accept loop; runs until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("HTTP gateway listening on {}", self.addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let pool = self.pool.clone();
                            let connect_timeout = self.connect_timeout;
                            let request_timeout = self.request_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    pool,
                                    connect_timeout,
                                    request_timeout,
                                )
                                .await
                                {
                                    debug!(client = %client_addr, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HTTP gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Sniff the first bytes and dispatch to the raw CONNECT path or hyper.
async fn handle_connection(
    mut stream: TcpStream,
    pool: Arc<ProxyPool>,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<()> {
    let mut prefix = [0u8; 8];
    stream.read_exact(&mut prefix).await?;

    if &prefix == b"CONNECT " {
        return handle_connect(stream, pool, connect_timeout).await;
    }

    let replayed = PrefixedStream::new(prefix.to_vec(), stream);
    let io = TokioIo::new(replayed);

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = pool.clone();
        async move {
            Ok::<_, Infallible>(
                handle_request(req, pool, connect_timeout, request_timeout).await,
            )
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| OutwayError::Http(e.to_string()))?;

    Ok(())
}

/// Raw CONNECT tunnel establishment.
///
/// `stream` is positioned just past the "CONNECT " method prefix; the
/// synthesized responses below are the wire contract with the client.
async fn handle_connect<S>(
    mut stream: S,
    pool: Arc<ProxyPool>,
    connect_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = read_request_head(&mut stream).await?;
    let request_line = head.lines().next().unwrap_or("");
    let authority = request_line
        .split_whitespace()
        .next()
        .ok_or_else(|| OutwayError::InvalidRequest("empty CONNECT request line".to_string()))?;

    let auth = GatewayAuth::from_config(&pool.config());
    if auth.is_enabled() {
        let header = find_header(&head, "proxy-authorization");
        if auth.validate_header(header.as_deref()).is_err() {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n",
                )
                .await?;
            return Ok(());
        }
    }

    let (target_host, target_port) = UpstreamTransport::parse_authority(authority)?;

    let proxy = match pool.select_next() {
        Ok(proxy) => proxy,
        Err(_) => {
            pool.note_unavailable();
            stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
                .await?;
            return Ok(());
        }
    };
    pool.note_request();

    debug!(
        proxy = %proxy.endpoint(),
        target = %format!("{}:{}", target_host, target_port),
        "CONNECT via upstream proxy"
    );

    let dialed = timeout(
        connect_timeout,
        UpstreamTransport::connect(&proxy, &target_host, target_port),
    )
    .await
    .unwrap_or(Err(OutwayError::Timeout));

    match dialed {
        Ok(upstream) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            pool.record_outcome(&proxy, true);
            let _ = tunnel::copy_bidirectional(stream, upstream).await;
        }
        Err(e) => {
            warn!(proxy = %proxy.endpoint(), "CONNECT failed: {}", e);
            pool.record_outcome(&proxy, false);
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
        }
    }

    Ok(())
}

/// Read the remainder of a request head, byte-wise so no bytes beyond the
/// blank line are consumed (they belong to the tunnel).
async fn read_request_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_BYTES {
            return Err(OutwayError::InvalidRequest(
                "request head too large".to_string(),
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn find_header(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Plain (non-CONNECT) request forwarding.
async fn handle_request<B>(
    req: Request<B>,
    pool: Arc<ProxyPool>,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let auth = GatewayAuth::from_config(&pool.config());
    if auth.validate(&req).is_err() {
        return auth.challenge_response();
    }

    let proxy = match pool.select_next() {
        Ok(proxy) => proxy,
        Err(e) => {
            pool.note_unavailable();
            warn!("No proxy available: {}", e);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No proxies available");
        }
    };
    pool.note_request();

    match forward_request(req, &proxy, connect_timeout, request_timeout).await {
        Ok(response) => {
            pool.record_outcome(&proxy, true);
            response
        }
        Err(e) => {
            warn!(proxy = %proxy.endpoint(), "Forward failed: {}", e);
            pool.record_outcome(&proxy, false);
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

/// Forward one request through the upstream proxy and copy the response
/// back verbatim.
///
/// http/https kinds get the request in absolute form on their own
/// listener (an https record still speaks plain HTTP proxying there; the
/// CONNECT tunnel is what carries HTTPS payloads). A socks5 kind gets a
/// tunnel to the target and origin-form HTTP over it.
async fn forward_request<B>(
    req: Request<B>,
    proxy: &ProxyEntry,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<Response<Full<Bytes>>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    if parts.uri.authority().is_none() {
        return Err(OutwayError::InvalidRequest(
            "proxy requests must use an absolute URI".to_string(),
        ));
    }
    let target_host = parts
        .uri
        .host()
        .ok_or_else(|| OutwayError::InvalidRequest("missing host in URI".to_string()))?
        .to_string();
    let target_port = parts.uri.port_u16().unwrap_or(80);

    let body_bytes = body
        .collect()
        .await
        .map_err(|e| OutwayError::InvalidRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();

    let (stream, outbound_uri) = if proxy.kind.is_socks() {
        let stream = timeout(
            connect_timeout,
            UpstreamTransport::connect(proxy, &target_host, target_port),
        )
        .await
        .map_err(|_| OutwayError::Timeout)??;
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        (stream, path)
    } else {
        let stream = timeout(connect_timeout, TcpStream::connect(proxy.endpoint()))
            .await
            .map_err(|_| OutwayError::Timeout)?
            .map_err(|e| {
                OutwayError::ProxyConnectionFailed(format!("TCP connect failed: {}", e))
            })?;
        (stream, parts.uri.to_string())
    };

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(outbound_uri);
    for (name, value) in &parts.headers {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    // SOCKS5 credentials are spent during the dial's sub-negotiation.
    if proxy.kind.is_http() {
        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", encoded));
        }
    }
    let request = builder
        .body(Full::new(body_bytes))
        .map_err(|e| OutwayError::InvalidRequest(format!("Failed to build request: {}", e)))?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| OutwayError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    let response = timeout(request_timeout, sender.send_request(request))
        .await
        .map_err(|_| OutwayError::Timeout)?
        .map_err(|e| OutwayError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

    let (parts, body) = response.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| OutwayError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
        .to_bytes();

    Ok(Response::from_parts(parts, Full::new(body_bytes)))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}

/// Hop-by-hop headers are between the client and this gateway; they are
/// never forwarded upstream.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Stream adapter that replays already-consumed bytes before the inner
/// stream, so the sniffed prefix can be handed back to hyper.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

//! SOCKS5 listener
//!
//! Strict fail-fast handling: any malformed byte drops the connection
//! without a reply. Only the CONNECT command is supported.
//!
//! The outbound dial goes straight to the requested target rather than
//! through the selected upstream proxy, yet the selected proxy's counters
//! own the outcome. That asymmetry is inherited behavior and must not be
//! changed without a product decision.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gateway::auth::GatewayAuth;
use crate::gateway::tunnel;
use crate::pool::ProxyPool;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Reply with the given code and a zeroed IPv4 bind address.
fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// The SOCKS5 side of the gateway
pub struct Socks5Gateway {
    pool: Arc<ProxyPool>,
    addr: String,
}

impl Socks5Gateway {
    pub fn new(pool: Arc<ProxyPool>, addr: String) -> Self {
        Self { pool, addr }
    }

    /// Accept loop; runs until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("SOCKS5 gateway listening on {}", self.addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let pool = self.pool.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_socks5(stream, pool).await {
                                    debug!(client = %client_addr, "SOCKS5 connection error: {}", e);
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
                        info!("SOCKS5 gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Drive one connection through greeting, optional auth, request, relay.
///
/// Generic over the stream so tests can drive it with duplex pipes.
pub(crate) async fn handle_socks5<S>(mut stream: S, pool: Arc<ProxyPool>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        debug!(version = header[0], "Dropping non-SOCKS5 client");
        return Ok(());
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let auth = GatewayAuth::from_config(&pool.config());
    if auth.is_enabled() {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_USERNAME_PASSWORD])
            .await?;
        if !subnegotiate(&mut stream, &auth).await? {
            return Ok(());
        }
    } else {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    }

    // Request: VER CMD RSV ATYP ...
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Ok(());
    }
    if request[1] != CMD_CONNECT {
        stream.write_all(&reply(REP_COMMAND_NOT_SUPPORTED)).await?;
        return Ok(());
    }

    let (host, port) = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            (
                Ipv4Addr::from(addr).to_string(),
                u16::from_be_bytes(port),
            )
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let Ok(host) = String::from_utf8(name) else {
                return Ok(());
            };
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            (host, u16::from_be_bytes(port))
        }
        _ => {
            stream
                .write_all(&reply(REP_ADDRESS_TYPE_NOT_SUPPORTED))
                .await?;
            return Ok(());
        }
    };

    connect_out(stream, pool, host, port).await
}

/// Username/password sub-negotiation (RFC 1929 byte layout).
async fn subnegotiate<S>(stream: &mut S, auth: &GatewayAuth) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != AUTH_VERSION {
        return Ok(false);
    }

    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username);
    let password = String::from_utf8_lossy(&password);

    if auth.check_credentials(&username, &password) {
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
        Ok(true)
    } else {
        debug!("SOCKS5 authentication failed");
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        Ok(false)
    }
}

/// Select a proxy, dial the target, reply, relay.
async fn connect_out<S>(mut stream: S, pool: Arc<ProxyPool>, host: String, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let proxy = match pool.select_next() {
        Ok(proxy) => proxy,
        Err(_) => {
            pool.note_unavailable();
            stream.write_all(&reply(REP_GENERAL_FAILURE)).await?;
            return Ok(());
        }
    };
    pool.note_request();

    // Direct dial; the selected proxy still owns the outcome.
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(target) => {
            stream.write_all(&reply(REP_SUCCEEDED)).await?;
            pool.record_outcome(&proxy, true);
            debug!(target = %format!("{}:{}", host, port), "SOCKS5 tunnel established");
            let _ = tunnel::copy_bidirectional(stream, target).await;
        }
        Err(e) => {
            warn!(target = %format!("{}:{}", host, port), "SOCKS5 dial failed: {}", e);
            pool.record_outcome(&proxy, false);
            stream.write_all(&reply(REP_GENERAL_FAILURE)).await?;
        }
    }

    Ok(())
}

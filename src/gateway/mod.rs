//! The dual-protocol gateway
//!
//! Two independent listeners share the proxy pool: an HTTP forward proxy
//! (including raw CONNECT tunneling) and a SOCKS5 server. Each accepted
//! connection selects one upstream proxy and relays through it.

pub mod auth;
pub mod http;
pub mod socks5;
pub mod transport;
pub mod tunnel;

pub use auth::GatewayAuth;
pub use http::HttpGateway;
pub use socks5::Socks5Gateway;
pub use transport::UpstreamTransport;

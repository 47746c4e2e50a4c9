//! Transport adapters.
//!
//! An [`Adapter`] turns an address into a bound [`Listener`] or a dialed
//! [`Connection`]. The runtime core never inspects transport options beyond
//! the adapter id; everything else is the adapter's business.

use crate::WireError;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Id of the built-in TCP adapter.
pub const TCP_ADAPTER_ID: &str = "tcp";

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A raw bidirectional byte stream yielded by an adapter.
pub struct Connection {
    /// Read half.
    pub reader: BoxedReader,
    /// Write half.
    pub writer: BoxedWriter,
    /// Remote socket address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap arbitrary halves.
    pub fn new(reader: BoxedReader, writer: BoxedWriter, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            reader,
            writer,
            remote_addr,
        }
    }

    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::new(Box::new(reader), Box::new(writer), remote_addr)
    }

    /// Remote IP address, when known.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr.map(|a| a.ip())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A bound listener yielding inbound connections.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Connection, WireError>;

    /// The address actually bound (useful when binding to port 0).
    fn local_addr(&self) -> String;
}

/// A transport implementation.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Registration id. Must be non-empty for `attach_adapter`.
    fn id(&self) -> &str;

    /// Address used when a gate names this adapter without an address.
    fn default_address(&self) -> Option<String> {
        None
    }

    /// Bind a listener on `address`.
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>, WireError>;

    /// Dial `address`.
    async fn dial(&self, address: &str) -> Result<Connection, WireError>;
}

/// Plain TCP transport.
#[derive(Debug, Clone)]
pub struct TcpAdapter {
    id: String,
    default_address: Option<String>,
}

impl TcpAdapter {
    /// The built-in adapter, id `"tcp"`.
    pub fn new() -> Self {
        Self {
            id: TCP_ADAPTER_ID.to_string(),
            default_address: None,
        }
    }

    /// A named TCP adapter bound to a fixed address, for `attach_adapter`.
    pub fn named(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            default_address: Some(address.into()),
        }
    }
}

impl Default for TcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct TcpGateListener {
    listener: TcpListener,
    local_addr: String,
}

#[async_trait]
impl Listener for TcpGateListener {
    async fn accept(&mut self) -> Result<Connection, WireError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Connection::from_tcp(stream))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[async_trait]
impl Adapter for TcpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_address(&self) -> Option<String> {
        self.default_address.clone()
    }

    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>, WireError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?.to_string();
        debug!(adapter = %self.id, %local_addr, "TCP listener bound");
        Ok(Box::new(TcpGateListener {
            listener,
            local_addr,
        }))
    }

    async fn dial(&self, address: &str) -> Result<Connection, WireError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Connection::from_tcp(stream))
    }
}

/// Fill in the host and/or port missing from `address`.
///
/// Accepts `host:port`, `host`, `:port`, bare IPv6 and bracketed IPv6.
pub fn normalize_address(address: &str, default_host: &str, default_port: u16) -> String {
    let address = address.trim();
    if address.is_empty() {
        return format!("{default_host}:{default_port}");
    }
    if let Some(port) = address.strip_prefix(':') {
        return format!("{default_host}:{port}");
    }
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    if address.starts_with('[') && address.ends_with(']') {
        return format!("{address}:{default_port}");
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ => format!("{address}:{default_port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_packet, write_packet};
    use crate::packet::{Action, Packet};
    use netron_types::PeerStatus;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("", "127.0.0.1", 8888), "127.0.0.1:8888");
        assert_eq!(normalize_address(":9000", "0.0.0.0", 8888), "0.0.0.0:9000");
        assert_eq!(normalize_address("10.0.0.1", "0.0.0.0", 8888), "10.0.0.1:8888");
        assert_eq!(normalize_address("10.0.0.1:1", "0.0.0.0", 8888), "10.0.0.1:1");
        assert_eq!(normalize_address("localhost", "0.0.0.0", 80), "localhost:80");
        assert_eq!(normalize_address("localhost:81", "0.0.0.0", 80), "localhost:81");
        assert_eq!(normalize_address("::1", "0.0.0.0", 80), "[::1]:80");
        assert_eq!(normalize_address("[::1]", "0.0.0.0", 80), "[::1]:80");
        assert_eq!(normalize_address("[::1]:81", "0.0.0.0", 80), "[::1]:81");
    }

    #[tokio::test]
    async fn test_tcp_adapter_bind_and_dial() {
        let adapter = TcpAdapter::new();
        assert_eq!(adapter.id(), TCP_ADAPTER_ID);

        let mut listener = adapter.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let dial = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.dial(&addr).await.unwrap() }
        });
        let mut inbound = listener.accept().await.unwrap();
        let mut outbound = dial.await.unwrap();

        assert_eq!(
            inbound.remote_ip(),
            Some("127.0.0.1".parse::<IpAddr>().unwrap())
        );

        let packet = Packet::request(Action::Ping, PeerStatus::Online, 5, serde_json::Value::Null);
        write_packet(&mut outbound.writer, &packet).await.unwrap();
        let got = read_packet(&mut inbound.reader, 1024).await.unwrap();
        assert_eq!(got.stream_id, 5);
    }

    #[test]
    fn test_named_adapter() {
        let adapter = TcpAdapter::named("internal", "127.0.0.1:0");
        assert_eq!(adapter.id(), "internal");
        assert_eq!(adapter.default_address().as_deref(), Some("127.0.0.1:0"));
    }
}

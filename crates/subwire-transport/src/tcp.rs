use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// TCP listening transport.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on `addr` (for example `127.0.0.1:4222` or `0.0.0.0:0`).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<(WireStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        let _ = stream.set_nodelay(true);
        debug!(%peer, "accepted connection");
        Ok((WireStream::from_tcp(stream), peer))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        assert_eq!(listener.transport_name(), "tcp");

        let client = tokio::spawn(async move {
            let mut client = WireStream::connect_tcp(&addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();
        });

        let (mut server, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let result = TcpTransport::bind("not-an-address").await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }
}

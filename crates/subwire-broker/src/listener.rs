use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use subwire_transport::TcpTransport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendFactory;
use crate::error::Result;
use crate::serve::{serve_with_shutdown, ServeConfig};

/// Accepts TCP connections and serves each one with its own backend.
pub struct BrokerListener {
    transport: TcpTransport,
    factory: Arc<dyn BackendFactory>,
    serve_config: ServeConfig,
    next_connection_id: AtomicU64,
}

impl BrokerListener {
    /// Bind to a TCP address.
    pub async fn bind(addr: &str, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let transport = TcpTransport::bind(addr).await?;
        Ok(Self {
            transport,
            factory,
            serve_config: ServeConfig::default(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Override per-session configuration.
    pub fn with_serve_config(mut self, config: ServeConfig) -> Self {
        self.serve_config = config;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled. Cancelling also ends
    /// every open session.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr(), "broker accepting connections");
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                },
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let backend = match self.factory.create().await {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(%err, connection = id, "failed to create backend; dropping connection");
                    continue;
                }
            };

            let config = self.serve_config.clone();
            let session_shutdown = shutdown.child_token();
            tokio::spawn(async move {
                debug!(connection = id, %peer, "session started");
                match serve_with_shutdown(stream, backend, config, session_shutdown).await {
                    Ok(()) => debug!(connection = id, %peer, "session closed"),
                    Err(err) => debug!(connection = id, %peer, %err, "session ended with error"),
                }
            });
        }
        info!("broker stopped accepting connections");
        Ok(())
    }
}

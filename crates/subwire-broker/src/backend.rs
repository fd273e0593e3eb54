use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use subwire_proto::InfoMap;

use crate::error::Result;

/// Receiver of a backend's deliveries.
///
/// The delivery loop awaits each call before producing the next one, so calls
/// arrive in delivery order.
#[async_trait]
pub trait Sink: Send {
    /// Called once, before any message.
    async fn on_info(&mut self, info: InfoMap) -> Result<()>;

    /// Called for every delivered message.
    async fn on_message(&mut self, subject: &str, payload: Bytes) -> Result<()>;
}

/// A publish/subscribe backend serving one client stream.
///
/// The request path (`publish`, `subscribe`, `unsubscribe`) and
/// `run_delivery_loop` run concurrently against the same instance.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<()>;

    /// Unsubscribing from a subject that is not subscribed is a no-op.
    async fn unsubscribe(&self, subject: &str) -> Result<()>;

    /// Announce the backend with [`Sink::on_info`], then push deliveries into
    /// `sink` until the backend or the sink stops.
    async fn run_delivery_loop(&self, sink: &mut dyn Sink) -> Result<()>;
}

/// Produces one backend per accepted connection.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Backend>>;
}

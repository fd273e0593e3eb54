use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use subwire_proto::ClientOperation;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Shared;
use crate::error::{ClientError, Result};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

/// Snapshot of a subscription's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub received_messages: u64,
    pub received_bytes: u64,
    /// Deliveries dropped because the queue was full.
    pub dropped: u64,
}

/// One consumer of a subject on a [`Client`](crate::Client).
///
/// Dropping a subscription closes it.
pub struct Subscription {
    id: u64,
    subject: String,
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    counters: Arc<Counters>,
    closed: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        subject: String,
        shared: Arc<Shared>,
        receiver: mpsc::Receiver<Bytes>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            id,
            subject,
            shared,
            receiver: tokio::sync::Mutex::new(receiver),
            counters,
            closed: CancellationToken::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish `payload` on this subscription's subject.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.closed.is_cancelled() || self.shared.fatal.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let payload = payload.into();
        let max = self.shared.config.codec.max_payload_size;
        if payload.len() > max {
            return Err(ClientError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let op = ClientOperation::publish(self.subject.as_str(), payload);
        tokio::select! {
            biased;
            _ = self.shared.fatal.cancelled() => Err(ClientError::Closed),
            _ = self.closed.cancelled() => Err(ClientError::Closed),
            sent = self.shared.outbound.send(op) => sent.map_err(|_| ClientError::Closed),
        }
    }

    /// Wait for the next message. Fails once the subscription or the client
    /// is closed.
    pub async fn receive(&self) -> Result<Bytes> {
        let mut receiver = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ClientError::Closed),
            receiver = self.receiver.lock() => receiver,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ClientError::Closed),
            payload = receiver.recv() => match payload {
                Some(payload) => {
                    self.counters.received_messages.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .received_bytes
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    Ok(payload)
                }
                None => Err(ClientError::Closed),
            },
        }
    }

    /// Stop receiving. Pending and future `receive` calls fail. Closing the
    /// last subscription on a subject unsubscribes from the backend.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        self.shared.release_route(&self.subject, self.id);
        debug!(subject = %self.subject, subscription = self.id, "subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.shared.fatal.is_cancelled()
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            received_messages: self.counters.received_messages.load(Ordering::Relaxed),
            received_bytes: self.counters.received_bytes.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("closed", &self.is_closed())
            .finish()
    }
}

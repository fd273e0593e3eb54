use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use subwire_proto::{is_valid_subject, InfoMap};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendFactory, Sink};
use crate::error::{BrokerError, Result};

type Delivery = (String, Bytes);

/// Subject index shared by every session of a [`MemoryBroker`].
///
/// Maps subject to the delivery queues of the sessions subscribed to it.
#[derive(Debug, Default)]
pub struct SubjectRegistry {
    subjects: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<Delivery>>>>,
}

impl SubjectRegistry {
    fn insert(&self, subject: &str, session: u64, sender: mpsc::Sender<Delivery>) {
        let mut subjects = self.subjects.write().unwrap_or_else(PoisonError::into_inner);
        subjects
            .entry(subject.to_string())
            .or_default()
            .insert(session, sender);
    }

    fn remove(&self, subject: &str, session: u64) -> bool {
        let mut subjects = self.subjects.write().unwrap_or_else(PoisonError::into_inner);
        let Some(sessions) = subjects.get_mut(subject) else {
            return false;
        };
        let removed = sessions.remove(&session).is_some();
        if sessions.is_empty() {
            subjects.remove(subject);
        }
        removed
    }

    /// Offer a message to every subscriber of `subject` without blocking.
    /// Returns the number of queues that accepted it.
    fn fan_out(&self, subject: &str, payload: &Bytes) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Delivery>)> = {
            let subjects = self.subjects.read().unwrap_or_else(PoisonError::into_inner);
            match subjects.get(subject) {
                Some(sessions) => sessions
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (session, sender) in targets {
            match sender.try_send((subject.to_string(), payload.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject, session, "subscriber queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subject, session, "subscriber gone, skipping");
                }
            }
        }
        delivered
    }

    /// Number of subjects with at least one subscriber.
    pub fn subject_count(&self) -> usize {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of sessions subscribed to `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .map_or(0, HashMap::len)
    }
}

/// Configuration for [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Name announced in each session's `INFO`. Default: `subwire-memory`.
    pub name: String,
    /// Per-session delivery queue capacity. Default: 64.
    pub sink_queue: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            name: "subwire-memory".to_string(),
            sink_queue: 64,
        }
    }
}

/// In-process broker. Each connection gets its own [`MemorySession`]; all
/// sessions share one [`SubjectRegistry`].
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    registry: Arc<SubjectRegistry>,
    config: MemoryBrokerConfig,
    next_session_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: Arc::new(SubjectRegistry::default()),
                config,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session with its own delivery queue.
    pub fn session(&self) -> MemorySession {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.config.sink_queue.max(1));

        let mut info = InfoMap::new();
        info.insert("name".to_string(), self.inner.config.name.clone());
        info.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        debug!(session = id, "memory session opened");
        MemorySession {
            id,
            registry: Arc::clone(&self.inner.registry),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            subjects: Mutex::new(HashSet::new()),
            info,
        }
    }

    pub fn registry(&self) -> &SubjectRegistry {
        &self.inner.registry
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendFactory for MemoryBroker {
    async fn create(&self) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(self.session()))
    }
}

/// One connection's view of a [`MemoryBroker`].
///
/// Dropping the session removes it from every subject it is still subscribed to.
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    registry: Arc<SubjectRegistry>,
    sender: mpsc::Sender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    subjects: Mutex<HashSet<String>>,
    info: InfoMap,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_subject(subject: &str) -> Result<()> {
        if is_valid_subject(subject) {
            Ok(())
        } else {
            Err(BrokerError::InvalidSubject(subject.to_string()))
        }
    }
}

#[async_trait]
impl Backend for MemorySession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        Self::check_subject(subject)?;
        let delivered = self.registry.fan_out(subject, &payload);
        trace!(session = self.id, subject, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<()> {
        Self::check_subject(subject)?;
        self.subjects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string());
        self.registry.insert(subject, self.id, self.sender.clone());
        debug!(session = self.id, subject, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> Result<()> {
        let was_subscribed = self
            .subjects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
        if was_subscribed {
            self.registry.remove(subject, self.id);
            debug!(session = self.id, subject, "unsubscribed");
        }
        Ok(())
    }

    async fn run_delivery_loop(&self, sink: &mut dyn Sink) -> Result<()> {
        sink.on_info(self.info.clone()).await?;

        let mut receiver = self.receiver.lock().await;
        while let Some((subject, payload)) = receiver.recv().await {
            sink.on_message(&subject, payload).await?;
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let subjects = std::mem::take(
            self.subjects
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subject in subjects {
            self.registry.remove(&subject, self.id);
        }
        debug!(session = self.id, "memory session closed");
    }
}

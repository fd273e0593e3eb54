use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use subwire_proto::{
    is_valid_subject, ClientCodec, ClientOperation, CodecConfig, CodecError, InfoMap,
    ServerOperation,
};
use subwire_transport::WireStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, FatalCause, Result};
use crate::subscription::{Counters, Subscription};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub codec: CodecConfig,
    /// Capacity of the queue feeding the stream writer. Default: 64.
    pub outbound_queue: usize,
    /// Per-subscription delivery queue capacity. A full queue drops. Default: 16.
    pub subscription_queue: usize,
    /// How long [`Client::close`] waits for queued operations to reach the
    /// stream. Default: 5s.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            outbound_queue: 64,
            subscription_queue: 16,
            close_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct Route {
    sender: mpsc::Sender<Bytes>,
    counters: Arc<Counters>,
}

/// State shared by the client handle, its tasks and its subscriptions.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) outbound: mpsc::Sender<ClientOperation>,
    /// Cancelled once the client is fatal or closed.
    pub(crate) fatal: CancellationToken,
    /// Cancelled by `Client::close` to let the writer drain.
    closing: CancellationToken,
    cause: OnceLock<FatalCause>,
    info: watch::Receiver<Option<InfoMap>>,
    routes: RwLock<HashMap<String, HashMap<u64, Route>>>,
    next_subscription_id: AtomicU64,
}

impl Shared {
    /// Enter the fatal state. The first cause wins.
    pub(crate) fn fail(&self, cause: FatalCause) {
        if self.cause.set(cause.clone()).is_ok() {
            match &cause {
                FatalCause::Closed | FatalCause::EndOfStream => debug!(%cause, "client stopped"),
                _ => warn!(%cause, "client failed"),
            }
        }
        // Dropping every route ends all pending receives.
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.fatal.cancel();
    }

    pub(crate) fn fatal_error(&self) -> ClientError {
        match self.cause.get() {
            Some(cause) => ClientError::Fatal(cause.clone()),
            None => ClientError::Closed,
        }
    }

    /// Offer a payload to every subscription on `subject` without blocking.
    fn dispatch(&self, subject: &str, payload: Bytes) {
        let targets: Vec<(mpsc::Sender<Bytes>, Arc<Counters>)> = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            match routes.get(subject) {
                Some(routes) => routes
                    .values()
                    .map(|route| (route.sender.clone(), Arc::clone(&route.counters)))
                    .collect(),
                None => {
                    trace!(subject, "no subscription for message");
                    return;
                }
            }
        };

        for (sender, counters) in targets {
            if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(payload.clone()) {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(subject, "subscription queue full, dropping message");
            }
        }
    }

    /// Remove a route without telling the backend.
    pub(crate) fn remove_route(&self, subject: &str, id: u64) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        remove_from(&mut routes, subject, id);
    }

    /// Remove a route. When it was the last one for its subject, `UNSUB` is
    /// queued while the route table is still locked, so a concurrent `dial`
    /// cannot get its `SUB` ahead of it.
    pub(crate) fn release_route(self: &Arc<Self>, subject: &str, id: u64) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if !remove_from(&mut routes, subject, id) || self.fatal.is_cancelled() {
            return;
        }
        match self.outbound.try_reserve() {
            Ok(permit) => permit.send(ClientOperation::unsubscribe(subject)),
            Err(mpsc::error::TrySendError::Full(())) => self.defer_unsubscribe(subject),
            Err(mpsc::error::TrySendError::Closed(())) => {}
        }
    }

    /// Queue `UNSUB` once the outbound queue has room, unless the subject has
    /// been dialed again in the meantime.
    fn defer_unsubscribe(self: &Arc<Self>, subject: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(subject, "no runtime, skipping UNSUB");
            return;
        };
        trace!(subject, "outbound queue full, deferring UNSUB");
        let shared = Arc::clone(self);
        let subject = subject.to_string();
        runtime.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = shared.fatal.cancelled() => return,
                permit = shared.outbound.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let routes = shared.routes.read().unwrap_or_else(PoisonError::into_inner);
            if routes.contains_key(&subject) {
                trace!(subject = %subject, "subject dialed again, dropping UNSUB");
                return;
            }
            permit.send(ClientOperation::unsubscribe(subject.as_str()));
        });
    }
}

/// Returns true if `id` was the last route for `subject`.
fn remove_from(routes: &mut HashMap<String, HashMap<u64, Route>>, subject: &str, id: u64) -> bool {
    let Some(subject_routes) = routes.get_mut(subject) else {
        return false;
    };
    if subject_routes.remove(&id).is_none() {
        return false;
    }
    if subject_routes.is_empty() {
        routes.remove(subject);
        return true;
    }
    false
}

/// A connection to a backend, multiplexing subscriptions over one stream.
///
/// Dropping the client stops it immediately; [`Client::close`] first flushes
/// queued operations.
pub struct Client {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client over `stream`. Must be called within a tokio runtime.
    pub fn open<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open_with_config(stream, ClientConfig::default())
    }

    pub fn open_with_config<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let frames_in = FramedRead::new(read_half, ClientCodec::with_config(config.codec.clone()));
        let frames_out =
            FramedWrite::new(write_half, ClientCodec::with_config(config.codec.clone()));

        let (outbound, queue) = mpsc::channel(config.outbound_queue.max(1));
        let (info_tx, info_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            config,
            outbound,
            fatal: CancellationToken::new(),
            closing: CancellationToken::new(),
            cause: OnceLock::new(),
            info: info_rx,
            routes: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        });

        tokio::spawn(read_loop(frames_in, Arc::clone(&shared), info_tx));
        let writer = tokio::spawn(write_loop(frames_out, queue, Arc::clone(&shared)));

        Self {
            shared,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Connect to a TCP backend.
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        Ok(Self::open(WireStream::connect_tcp(addr).await?))
    }

    /// Spawn a backend process and talk to it over its stdin/stdout.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Ok(Self::open(WireStream::spawn(program, args)?))
    }

    /// Subscribe to `subject`. Every call yields an independent subscription.
    pub async fn dial(&self, subject: &str) -> Result<Subscription> {
        if !is_valid_subject(subject) {
            return Err(ClientError::InvalidSubject(subject.to_string()));
        }
        if self.shared.fatal.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let id = self
            .shared
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.shared.config.subscription_queue.max(1));
        let counters = Arc::new(Counters::default());

        // Route first so nothing sent right after SUB is missed.
        self.shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subject.to_string())
            .or_default()
            .insert(
                id,
                Route {
                    sender,
                    counters: Arc::clone(&counters),
                },
            );

        let sent = tokio::select! {
            biased;
            _ = self.shared.fatal.cancelled() => false,
            sent = self.shared.outbound.send(ClientOperation::subscribe(subject)) => sent.is_ok(),
        };
        if !sent {
            self.shared.remove_route(subject, id);
            return Err(ClientError::Closed);
        }

        debug!(subject, subscription = id, "dialed");
        Ok(Subscription::new(
            id,
            subject.to_string(),
            Arc::clone(&self.shared),
            receiver,
            counters,
        ))
    }

    /// Wait for the backend's first `INFO`. Later `INFO` frames are ignored.
    pub async fn info(&self) -> Result<InfoMap> {
        let mut info = self.shared.info.clone();
        let received = tokio::select! {
            biased;
            result = info.wait_for(Option::is_some) => result.ok().and_then(|map| map.clone()),
            _ = self.shared.fatal.cancelled() => None,
        };
        match received {
            Some(map) => Ok(map),
            None => Err(self.shared.fatal_error()),
        }
    }

    /// Flush queued operations, then stop the client. Further operations fail
    /// with [`ClientError::Closed`] or the retained fatal cause.
    pub async fn close(&self) {
        self.shared.closing.cancel();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            let limit = self.shared.config.close_timeout;
            if tokio::time::timeout(limit, &mut writer).await.is_err() {
                debug!(?limit, "flush on close timed out");
            }
        }
        self.shared.fail(FatalCause::Closed);
    }

    /// The retained fatal cause, if the client has stopped.
    pub fn fatal_error(&self) -> Option<FatalCause> {
        self.shared.cause.get().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.fatal.is_cancelled()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.fail(FatalCause::Closed);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, ClientCodec>,
    shared: Arc<Shared>,
    info: watch::Sender<Option<InfoMap>>,
) where
    R: AsyncRead + Unpin,
{
    let cause = loop {
        let next = tokio::select! {
            biased;
            _ = shared.fatal.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            None => break FatalCause::EndOfStream,
            Some(Err(err)) => break FatalCause::from(err),
            Some(Ok(ServerOperation::Info(map))) => {
                info.send_if_modified(|slot| {
                    if slot.is_some() {
                        debug!("ignoring repeated INFO");
                        return false;
                    }
                    *slot = Some(map);
                    true
                });
            }
            Some(Ok(ServerOperation::Message { subject, payload })) => {
                shared.dispatch(&subject, payload);
            }
            Some(Ok(ServerOperation::Ok)) => trace!("ack"),
            Some(Ok(ServerOperation::Error(message))) => break FatalCause::Server(message),
        }
    };
    shared.fail(cause);
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, ClientCodec>,
    mut queue: mpsc::Receiver<ClientOperation>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let op = tokio::select! {
            biased;
            _ = shared.fatal.cancelled() => return,
            op = queue.recv() => op,
            _ = shared.closing.cancelled() => {
                let flushed = tokio::select! {
                    biased;
                    _ = shared.fatal.cancelled() => return,
                    flushed = flush_queue(&mut frames, &mut queue) => flushed,
                };
                if let Err(err) = flushed {
                    debug!(%err, "flushing on close failed");
                }
                return;
            }
        };

        let Some(op) = op else {
            return;
        };
        trace!(op = op.name(), subject = op.subject(), "writing");
        let sent = tokio::select! {
            biased;
            _ = shared.fatal.cancelled() => return,
            sent = frames.send(op) => sent,
        };
        if let Err(err) = sent {
            shared.fail(err.into());
            return;
        }
    }
}

async fn flush_queue<W>(
    frames: &mut FramedWrite<W, ClientCodec>,
    queue: &mut mpsc::Receiver<ClientOperation>,
) -> std::result::Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(op) = queue.try_recv() {
        frames.feed(op).await?;
    }
    frames.close().await
}

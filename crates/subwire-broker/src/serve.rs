use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use subwire_proto::{ClientOperation, CodecConfig, InfoMap, ServerCodec, ServerOperation};
use subwire_transport::WireStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, Sink};
use crate::error::{BrokerError, Result};

/// Configuration for a served session.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub codec: CodecConfig,
    /// Capacity of the queue feeding the stream writer. Default: 64.
    pub outbound_queue: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            outbound_queue: 64,
        }
    }
}

/// Run the protocol over `stream` against `backend` until the session ends.
///
/// Requests are answered with `+OK` or `-ERR`; malformed frames get `-ERR`
/// and the session continues. The session ends when the stream ends, the
/// stream fails, or the backend's delivery loop stops.
pub async fn serve<S>(stream: S, backend: Arc<dyn Backend>, config: ServeConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    serve_with_shutdown(stream, backend, config, CancellationToken::new()).await
}

/// [`serve`] that also ends when `shutdown` is cancelled.
pub async fn serve_with_shutdown<S>(
    stream: S,
    backend: Arc<dyn Backend>,
    config: ServeConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut requests = FramedRead::new(read_half, ServerCodec::with_config(config.codec.clone()));
    let frames = FramedWrite::new(write_half, ServerCodec::with_config(config.codec));
    let (outbound, queue) = mpsc::channel(config.outbound_queue.max(1));

    let writer = tokio::spawn(write_loop(frames, queue, shutdown.clone()));

    let (info_queued, info_ready) = oneshot::channel();
    let mut sink = WireSink {
        outbound: outbound.clone(),
        info_queued: Some(info_queued),
    };
    let outcome = tokio::select! {
        result = request_loop(&mut requests, backend.as_ref(), &outbound, info_ready) => result,
        result = backend.run_delivery_loop(&mut sink) => result,
        _ = shutdown.cancelled() => Ok(()),
    };
    shutdown.cancel();
    drop(sink);
    drop(outbound);

    let written = writer.await.unwrap_or(Err(BrokerError::Closed));
    debug!("session ended");
    outcome.and(written)
}

/// Serve `backend` over this process's stdin and stdout.
pub async fn serve_stdio(backend: Arc<dyn Backend>, config: ServeConfig) -> Result<()> {
    serve(WireStream::stdio(), backend, config).await
}

async fn request_loop<R>(
    requests: &mut FramedRead<R, ServerCodec>,
    backend: &dyn Backend,
    outbound: &mpsc::Sender<ServerOperation>,
    info_ready: oneshot::Receiver<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    // INFO is always the first frame of a session.
    let _ = info_ready.await;

    while let Some(item) = requests.next().await {
        let reply = match item? {
            Ok(op) => {
                trace!(op = op.name(), subject = op.subject(), "request");
                let result = match op {
                    ClientOperation::Subscribe { subject } => backend.subscribe(&subject).await,
                    ClientOperation::Unsubscribe { subject } => {
                        backend.unsubscribe(&subject).await
                    }
                    ClientOperation::Publish { subject, payload } => {
                        backend.publish(&subject, payload).await
                    }
                };
                match result {
                    Ok(()) => ServerOperation::Ok,
                    Err(err) => {
                        warn!(%err, "backend rejected request");
                        ServerOperation::error(err.to_string())
                    }
                }
            }
            Err(err) => {
                debug!(%err, "malformed frame");
                ServerOperation::error(err.to_string())
            }
        };
        outbound.send(reply).await.map_err(|_| BrokerError::Closed)?;
    }
    debug!("client stream ended");
    Ok(())
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, ServerCodec>,
    mut queue: mpsc::Receiver<ServerOperation>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        loop {
            tokio::select! {
                biased;
                op = queue.recv() => match op {
                    Some(op) => frames.send(op).await?,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    // Flush replies that were queued before the session ended.
                    while let Ok(op) = queue.try_recv() {
                        frames.feed(op).await?;
                    }
                    frames.flush().await?;
                    break;
                }
            }
        }
        Ok::<(), BrokerError>(())
    }
    .await;
    shutdown.cancel();
    result
}

/// Sink that turns deliveries into `INFO`/`MSG` frames on the session's stream.
struct WireSink {
    outbound: mpsc::Sender<ServerOperation>,
    /// Fired once INFO is queued; releases the request loop.
    info_queued: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl Sink for WireSink {
    async fn on_info(&mut self, info: InfoMap) -> Result<()> {
        self.outbound
            .send(ServerOperation::Info(info))
            .await
            .map_err(|_| BrokerError::Closed)?;
        if let Some(queued) = self.info_queued.take() {
            let _ = queued.send(());
        }
        Ok(())
    }

    async fn on_message(&mut self, subject: &str, payload: Bytes) -> Result<()> {
        self.outbound
            .send(ServerOperation::message(subject, payload))
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use subwire_proto::ClientCodec;
    use tokio::io::AsyncWriteExt;

    type ClientReader = FramedRead<tokio::io::ReadHalf<WireStream>, ClientCodec>;
    type ClientWriter = FramedWrite<tokio::io::WriteHalf<WireStream>, ClientCodec>;

    fn start(backend: Arc<dyn Backend>) -> (ClientReader, ClientWriter, tokio::task::JoinHandle<Result<()>>) {
        let (client_end, server_end) = WireStream::pipe(4096);
        let session = tokio::spawn(serve(server_end, backend, ServeConfig::default()));
        let (read_half, write_half) = tokio::io::split(client_end);
        (
            FramedRead::new(read_half, ClientCodec::new()),
            FramedWrite::new(write_half, ClientCodec::new()),
            session,
        )
    }

    async fn next_op(reader: &mut ClientReader) -> ServerOperation {
        reader
            .next()
            .await
            .expect("stream should stay open")
            .expect("frame should decode")
    }

    #[tokio::test]
    async fn info_then_ack_and_delivery() {
        let broker = MemoryBroker::new();
        let (mut reader, mut writer, _session) = start(Arc::new(broker.session()));

        let info = next_op(&mut reader).await;
        assert!(matches!(&info, ServerOperation::Info(map) if map["name"] == "subwire-memory"));

        writer.send(ClientOperation::subscribe("mytopic")).await.unwrap();
        assert_eq!(next_op(&mut reader).await, ServerOperation::Ok);

        writer
            .send(ClientOperation::publish("mytopic", &b"hello"[..]))
            .await
            .unwrap();

        // The ack and the self-delivery travel independently.
        let mut got = vec![next_op(&mut reader).await, next_op(&mut reader).await];
        got.sort_by_key(|op| op.name());
        assert_eq!(
            got,
            vec![
                ServerOperation::Ok,
                ServerOperation::message("mytopic", &b"hello"[..])
            ]
        );
    }

    #[tokio::test]
    async fn info_precedes_replies_to_early_requests() {
        struct SlowInfo;

        #[async_trait]
        impl Backend for SlowInfo {
            async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<()> {
                Ok(())
            }
            async fn subscribe(&self, _subject: &str) -> Result<()> {
                Ok(())
            }
            async fn unsubscribe(&self, _subject: &str) -> Result<()> {
                Ok(())
            }
            async fn run_delivery_loop(&self, sink: &mut dyn Sink) -> Result<()> {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                sink.on_info(InfoMap::new()).await?;
                std::future::pending().await
            }
        }

        let (client_end, server_end) = WireStream::pipe(4096);
        let (read_half, mut write_half) = tokio::io::split(client_end);
        write_half.write_all(b"SUB a\nBOGUS\n").await.unwrap();
        let _session = tokio::spawn(serve(server_end, Arc::new(SlowInfo), ServeConfig::default()));
        let mut reader = FramedRead::new(read_half, ClientCodec::new());

        assert!(matches!(next_op(&mut reader).await, ServerOperation::Info(_)));
        assert_eq!(next_op(&mut reader).await, ServerOperation::Ok);
        assert_eq!(
            next_op(&mut reader).await,
            ServerOperation::error("unknown operation 'BOGUS'")
        );
    }

    #[tokio::test]
    async fn info_is_first_for_memory_sessions_with_pending_input() {
        let broker = MemoryBroker::new();
        for _ in 0..50 {
            let (client_end, server_end) = WireStream::pipe(4096);
            let (read_half, mut write_half) = tokio::io::split(client_end);
            write_half.write_all(b"SUB a\n").await.unwrap();
            let _session = tokio::spawn(serve(
                server_end,
                Arc::new(broker.session()),
                ServeConfig::default(),
            ));
            let mut reader = FramedRead::new(read_half, ClientCodec::new());
            assert!(matches!(next_op(&mut reader).await, ServerOperation::Info(_)));
            assert_eq!(next_op(&mut reader).await, ServerOperation::Ok);
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_session_continues() {
        let broker = MemoryBroker::new();
        let (client_end, server_end) = WireStream::pipe(4096);
        let _session = tokio::spawn(serve(server_end, Arc::new(broker.session()), ServeConfig::default()));
        let (read_half, mut write_half) = tokio::io::split(client_end);
        let mut reader = FramedRead::new(read_half, ClientCodec::new());

        assert!(matches!(next_op(&mut reader).await, ServerOperation::Info(_)));

        write_half.write_all(b"BOGUS thing\nSUB ok\n").await.unwrap();
        assert_eq!(
            next_op(&mut reader).await,
            ServerOperation::error("unknown operation 'BOGUS'")
        );
        assert_eq!(next_op(&mut reader).await, ServerOperation::Ok);
        assert_eq!(broker.registry().subscriber_count("ok"), 1);
    }

    #[tokio::test]
    async fn backend_error_becomes_err_frame() {
        struct Rejecting;

        #[async_trait]
        impl Backend for Rejecting {
            async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<()> {
                Err(BrokerError::DatagramTooLarge { size: 9000, max: 8192 })
            }
            async fn subscribe(&self, _subject: &str) -> Result<()> {
                Ok(())
            }
            async fn unsubscribe(&self, _subject: &str) -> Result<()> {
                Ok(())
            }
            async fn run_delivery_loop(&self, sink: &mut dyn Sink) -> Result<()> {
                sink.on_info(InfoMap::new()).await?;
                std::future::pending().await
            }
        }

        let (mut reader, mut writer, _session) = start(Arc::new(Rejecting));
        assert!(matches!(next_op(&mut reader).await, ServerOperation::Info(_)));

        writer
            .send(ClientOperation::publish("big", vec![0u8; 10]))
            .await
            .unwrap();
        assert_eq!(
            next_op(&mut reader).await,
            ServerOperation::error("datagram too large (9000 bytes, max 8192)")
        );
    }

    #[tokio::test]
    async fn session_ends_on_client_eof_and_cleans_up() {
        let broker = MemoryBroker::new();
        let (mut reader, mut writer, session) = start(Arc::new(broker.session()));
        assert!(matches!(next_op(&mut reader).await, ServerOperation::Info(_)));

        writer.send(ClientOperation::subscribe("t")).await.unwrap();
        assert_eq!(next_op(&mut reader).await, ServerOperation::Ok);
        assert_eq!(broker.registry().subscriber_count("t"), 1);

        writer.close().await.unwrap();
        drop(writer);

        session
            .await
            .expect("session task should not panic")
            .expect("clean EOF should end the session without error");
        assert_eq!(broker.registry().subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn shutdown_token_ends_session() {
        let broker = MemoryBroker::new();
        let (_client_end, server_end) = WireStream::pipe(1024);
        let token = CancellationToken::new();
        let session = tokio::spawn(serve_with_shutdown(
            server_end,
            Arc::new(broker.session()),
            ServeConfig::default(),
            token.clone(),
        ));

        token.cancel();
        session.await.unwrap().unwrap();
    }
}

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use subwire_proto::{is_valid_subject, InfoMap};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Sink};
use crate::error::{BrokerError, Result};
use crate::nonce::{NonceWindow, DEFAULT_NONCE_TTL};

/// Default socket receive buffer and maximum datagram size.
pub const DEFAULT_RECV_BUFFER: usize = 8192;

const PROTOCOL_VERSION: &str = "0.1";

/// Configuration for [`MulticastBackend`].
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Multicast group address and port. Default: `224.0.0.1:9999`.
    pub group: SocketAddrV4,
    /// Interface name (or IPv4 address) to join the group on. `None` lets the
    /// kernel pick.
    pub interface: Option<String>,
    /// Socket receive buffer, also the largest datagram accepted. Default: 8192.
    pub recv_buffer_size: usize,
    /// How long a nonce is remembered for deduplication. Default: 10s.
    pub nonce_ttl: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 1), 9999),
            interface: None,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            nonce_ttl: DEFAULT_NONCE_TTL,
        }
    }
}

/// Wire form of one multicast message. Byte fields are base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Datagram {
    #[serde(rename = "Subject")]
    subject: String,
    #[serde(rename = "Payload", with = "base64_bytes", default)]
    payload: Vec<u8>,
    #[serde(rename = "Nonce", with = "base64_bytes", default)]
    nonce: Vec<u8>,
}

mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    // `null` decodes as empty.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Decides which inbound datagrams reach the sink.
#[derive(Debug)]
struct InboundFilter {
    subjects: RwLock<HashSet<String>>,
    nonces: NonceWindow,
}

impl InboundFilter {
    fn new(nonce_ttl: Duration) -> Self {
        Self {
            subjects: RwLock::new(HashSet::new()),
            nonces: NonceWindow::new(nonce_ttl),
        }
    }

    fn subscribe(&self, subject: &str) {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string());
    }

    fn unsubscribe(&self, subject: &str) {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
    }

    fn is_subscribed(&self, subject: &str) -> bool {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(subject)
    }

    /// Decode `raw` and return it if it is new and of interest.
    fn admit(&self, raw: &[u8]) -> Option<Datagram> {
        let datagram: Datagram = match serde_json::from_slice(raw) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(%err, len = raw.len(), "dropping undecodable datagram");
                return None;
            }
        };
        if self.nonces.seen(&datagram.nonce) {
            trace!(subject = %datagram.subject, "dropping duplicate datagram");
            return None;
        }
        if !self.is_subscribed(&datagram.subject) {
            trace!(subject = %datagram.subject, "no local interest");
            return None;
        }
        Some(datagram)
    }
}

struct Received {
    len: usize,
    /// Destination address from the packet header, where the platform reports it.
    destination: Option<Ipv4Addr>,
    truncated: bool,
}

/// Backend that maps every subject onto one UDP multicast group.
///
/// Every instance sees every datagram sent to the group; subject filtering and
/// deduplication happen after receipt. Own transmissions looped back by the
/// network stack are recognized by their nonce and dropped.
#[derive(Debug)]
pub struct MulticastBackend {
    socket: UdpSocket,
    group: SocketAddrV4,
    recv_buffer_size: usize,
    filter: InboundFilter,
}

impl MulticastBackend {
    /// Create the socket and join the group. Must be called within a tokio runtime.
    pub fn bind(config: MulticastConfig) -> Result<Self> {
        let group = config.group;
        if !group.ip().is_multicast() {
            return Err(BrokerError::Setup(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a multicast address", group.ip()),
            )));
        }

        let interface = resolve_interface(config.interface.as_deref())?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(BrokerError::Setup)?;
        socket.set_reuse_address(true).map_err(BrokerError::Setup)?;
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            warn!("failed to set multicast recv buffer: {}", e);
        }
        socket.set_nonblocking(true).map_err(BrokerError::Setup)?;

        // Linux reports the destination address per packet, so bind to any
        // address and filter there. Elsewhere bind to the group itself.
        #[cfg(target_os = "linux")]
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        #[cfg(not(target_os = "linux"))]
        let bind_addr = group;

        socket
            .bind(&SocketAddr::V4(bind_addr).into())
            .map_err(|e| {
                BrokerError::Transport(subwire_transport::TransportError::Bind {
                    addr: bind_addr.to_string(),
                    source: e,
                })
            })?;
        socket
            .join_multicast_v4(group.ip(), &interface)
            .map_err(BrokerError::Setup)?;
        socket
            .set_multicast_if_v4(&interface)
            .map_err(BrokerError::Setup)?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(BrokerError::Setup)?;

        #[cfg(target_os = "linux")]
        enable_pktinfo(&socket).map_err(BrokerError::Setup)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(BrokerError::Setup)?;

        info!(%group, %interface, "joined multicast group");

        Ok(Self {
            socket,
            group,
            recv_buffer_size: config.recv_buffer_size,
            filter: InboundFilter::new(config.nonce_ttl),
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    #[cfg(target_os = "linux")]
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<Received> {
        use std::os::fd::AsRawFd;

        let fd = self.socket.as_raw_fd();
        self.socket
            .async_io(tokio::io::Interest::READABLE, || recv_with_destination(fd, buf))
            .await
    }

    #[cfg(not(target_os = "linux"))]
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<Received> {
        let len = self.socket.recv(buf).await?;
        Ok(Received {
            len,
            destination: None,
            truncated: false,
        })
    }
}

#[async_trait]
impl Backend for MulticastBackend {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if !is_valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let nonce: [u8; 16] = rand::random();
        let encoded = serde_json::to_vec(&Datagram {
            subject: subject.to_string(),
            payload: payload.to_vec(),
            nonce: nonce.to_vec(),
        })?;
        if encoded.len() > self.recv_buffer_size {
            return Err(BrokerError::DatagramTooLarge {
                size: encoded.len(),
                max: self.recv_buffer_size,
            });
        }

        // Registered before sending so the looped-back copy is recognized.
        self.filter.nonces.seen(&nonce);

        self.socket
            .send_to(&encoded, self.group)
            .await
            .map_err(BrokerError::Send)?;
        trace!(subject, len = encoded.len(), "sent datagram");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<()> {
        if !is_valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        self.filter.subscribe(subject);
        debug!(subject, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> Result<()> {
        self.filter.unsubscribe(subject);
        debug!(subject, "unsubscribed");
        Ok(())
    }

    async fn run_delivery_loop(&self, sink: &mut dyn Sink) -> Result<()> {
        let mut info = InfoMap::new();
        info.insert("type".to_string(), "multicast".to_string());
        info.insert("version".to_string(), PROTOCOL_VERSION.to_string());
        sink.on_info(info).await?;

        let mut buf = vec![0u8; self.recv_buffer_size];
        loop {
            let received = self
                .recv_datagram(&mut buf)
                .await
                .map_err(BrokerError::Receive)?;

            if received
                .destination
                .is_some_and(|dst| dst != *self.group.ip())
            {
                trace!(dst = ?received.destination, "ignoring datagram for another address");
                continue;
            }
            if received.truncated {
                warn!(max = self.recv_buffer_size, "dropping oversized datagram");
                continue;
            }

            if let Some(datagram) = self.filter.admit(&buf[..received.len]) {
                sink.on_message(&datagram.subject, Bytes::from(datagram.payload))
                    .await?;
            }
        }
    }
}

fn resolve_interface(interface: Option<&str>) -> Result<Ipv4Addr> {
    let Some(name) = interface else {
        return Ok(Ipv4Addr::UNSPECIFIED);
    };
    if let Ok(addr) = name.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    #[cfg(unix)]
    {
        Ok(subwire_transport::interface_ipv4(name)?)
    }
    #[cfg(not(unix))]
    {
        Err(subwire_transport::TransportError::InterfaceNotFound(name.to_string()).into())
    }
}

#[cfg(target_os = "linux")]
fn enable_pktinfo(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let on: libc::c_int = 1;
    // SAFETY: `on` outlives the call and its size is passed alongside; the
    // descriptor is an open UDP socket.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            (&on as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Receive one datagram with `recvmsg`, extracting the `IP_PKTINFO`
/// destination address from the ancillary data.
#[cfg(target_os = "linux")]
fn recv_with_destination(fd: std::os::fd::RawFd, buf: &mut [u8]) -> std::io::Result<Received> {
    // u64 elements keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; 16];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = std::mem::size_of_val(&control) as _;

    // SAFETY: `msg` points at `iov` and `control`, both live and sized for the call.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut destination = None;
    // SAFETY: the CMSG_* macros walk the control buffer the kernel just filled,
    // bounded by `msg.msg_controllen`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info: libc::in_pktinfo =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>());
                destination = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Received {
        len: n as usize,
        destination,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::*;

    fn datagram_json(subject: &str, payload: &[u8], nonce: &[u8]) -> Vec<u8> {
        format!(
            r#"{{"Subject":"{subject}","Payload":"{}","Nonce":"{}"}}"#,
            BASE64_STANDARD.encode(payload),
            BASE64_STANDARD.encode(nonce)
        )
        .into_bytes()
    }

    #[test]
    fn datagram_wire_format() {
        let datagram = Datagram {
            subject: "mytopic".to_string(),
            payload: b"hello".to_vec(),
            nonce: vec![1; 16],
        };
        let encoded = serde_json::to_string(&datagram).unwrap();
        assert_eq!(
            encoded,
            r#"{"Subject":"mytopic","Payload":"aGVsbG8=","Nonce":"AQEBAQEBAQEBAQEBAQEBAQ=="}"#
        );
    }

    #[test]
    fn null_payload_decodes_as_empty() {
        let datagram: Datagram =
            serde_json::from_str(r#"{"Subject":"s","Payload":null,"Nonce":"AAE="}"#).unwrap();
        assert!(datagram.payload.is_empty());
        assert_eq!(datagram.nonce, vec![0, 1]);
    }

    #[test]
    fn filter_drops_duplicates_and_uninteresting_subjects() {
        let filter = InboundFilter::new(DEFAULT_NONCE_TTL);
        filter.subscribe("wanted");

        let first = datagram_json("wanted", b"one", b"nonce-1");
        let admitted = filter.admit(&first).expect("first copy should pass");
        assert_eq!(admitted.payload, b"one");

        assert!(filter.admit(&first).is_none(), "second copy is a duplicate");

        let other = datagram_json("other", b"two", b"nonce-2");
        assert!(filter.admit(&other).is_none());

        assert!(filter.admit(b"not json").is_none());
    }

    #[test]
    fn own_publication_is_suppressed() {
        let filter = InboundFilter::new(DEFAULT_NONCE_TTL);
        filter.subscribe("echo");
        filter.nonces.seen(b"mine");

        assert!(filter.admit(&datagram_json("echo", b"x", b"mine")).is_none());
        assert!(filter.admit(&datagram_json("echo", b"x", b"theirs")).is_some());
    }

    #[test]
    fn unsubscribe_stops_admission() {
        let filter = InboundFilter::new(DEFAULT_NONCE_TTL);
        filter.subscribe("t");
        filter.unsubscribe("t");
        filter.unsubscribe("t");
        assert!(filter.admit(&datagram_json("t", b"x", b"n")).is_none());
    }

    #[tokio::test]
    async fn bind_rejects_unicast_group() {
        let config = MulticastConfig {
            group: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9999),
            ..MulticastConfig::default()
        };
        let err = MulticastBackend::bind(config).unwrap_err();
        assert!(matches!(err, BrokerError::Setup(_)));
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Info(InfoMap),
        Message(String, Bytes),
    }

    struct ChannelSink(tokio::sync::mpsc::Sender<Event>);

    #[async_trait]
    impl Sink for ChannelSink {
        async fn on_info(&mut self, info: InfoMap) -> Result<()> {
            self.0.send(Event::Info(info)).await.map_err(|_| BrokerError::Closed)
        }

        async fn on_message(&mut self, subject: &str, payload: Bytes) -> Result<()> {
            self.0
                .send(Event::Message(subject.to_string(), payload))
                .await
                .map_err(|_| BrokerError::Closed)
        }
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.local_addr())
            .map(|addr| addr.port())
            .unwrap_or(47999)
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .expect("sink open")
    }

    /// Loopback exchange between two backends on one host. Skips when the
    /// host cannot join or send to a multicast group.
    #[tokio::test]
    async fn loopback_delivers_foreign_messages_only() {
        use std::sync::Arc;
        use tokio::sync::mpsc;

        let config = MulticastConfig {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 1), free_udp_port()),
            ..MulticastConfig::default()
        };
        let (receiver, sender) = match (
            MulticastBackend::bind(config.clone()),
            MulticastBackend::bind(config.clone()),
        ) {
            (Ok(receiver), Ok(sender)) => (Arc::new(receiver), sender),
            (Err(err), _) | (_, Err(err)) => {
                eprintln!("skipping: multicast unavailable: {err}");
                return;
            }
        };
        receiver.subscribe("mytopic").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let loop_backend = Arc::clone(&receiver);
        tokio::spawn(async move {
            let mut sink = ChannelSink(tx);
            let _ = loop_backend.run_delivery_loop(&mut sink).await;
        });

        match next_event(&mut rx).await {
            Event::Info(info) => {
                assert_eq!(info["type"], "multicast");
                assert_eq!(info["version"], PROTOCOL_VERSION);
            }
            other => panic!("expected INFO first, got {other:?}"),
        }

        // Own publication loops back and is recognized by its nonce.
        if let Err(err) = receiver.publish("mytopic", Bytes::from_static(b"own")).await {
            eprintln!("skipping: multicast send failed: {err}");
            return;
        }

        // Unicast to the group port never counts as group traffic.
        let unicast = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        unicast
            .send_to(
                &datagram_json("mytopic", b"unicast", b"unicast-nonce"),
                (Ipv4Addr::LOCALHOST, config.group.port()),
            )
            .unwrap();

        sender
            .publish("mytopic", Bytes::from_static(b"foreign"))
            .await
            .unwrap();
        sender
            .publish("mytopic", Bytes::from_static(b"foreign2"))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            Event::Message("mytopic".to_string(), Bytes::from_static(b"foreign"))
        );
        assert_eq!(
            next_event(&mut rx).await,
            Event::Message("mytopic".to_string(), Bytes::from_static(b"foreign2"))
        );
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "unexpected delivery: {extra:?}");
    }
}

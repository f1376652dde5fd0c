//! Peer Link
//!
//! One MQTT connection between two mesh nodes. A link is either
//! *accepted* (the peer dialed us, identity learned from its CONNECT) or
//! *dialed* (we dialed the peer, identity is the configured peer name).
//!
//! The stream is split so the read loop and writers never contend: the read
//! half is owned by the link's read loop, the write half sits behind an
//! async mutex shared by every task that sends on the link.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{DecodeError, EncodeError, Packet};
use crate::topic::{DeliveryError, Subscriber};

use super::processor::Processor;

/// Any byte stream a link can run over: TCP, TLS, or an in-memory duplex
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// The peer connected to our listener
    Accepted,
    /// We connected to the peer
    Dialed,
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRole::Accepted => write!(f, "accepted"),
            LinkRole::Dialed => write!(f, "dialed"),
        }
    }
}

/// Link error types
#[derive(Debug)]
pub enum LinkError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    /// The link was closed locally
    Closed,
    /// The peer closed the connection
    PeerClosed,
    Timeout,
    /// The connection did not start with a valid CONNECT
    Handshake(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "IO error: {}", e),
            LinkError::Decode(e) => write!(f, "Decode error: {}", e),
            LinkError::Encode(e) => write!(f, "Encode error: {}", e),
            LinkError::Closed => write!(f, "link closed"),
            LinkError::PeerClosed => write!(f, "connection closed by peer"),
            LinkError::Timeout => write!(f, "timed out"),
            LinkError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e)
    }
}

impl From<DecodeError> for LinkError {
    fn from(e: DecodeError) -> Self {
        LinkError::Decode(e)
    }
}

impl From<EncodeError> for LinkError {
    fn from(e: EncodeError) -> Self {
        LinkError::Encode(e)
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LinkError::Timeout
    }
}

struct ReadState {
    reader: BoxedReader,
    buf: BytesMut,
    decoder: Decoder,
}

/// A connection to another mesh node
pub struct PeerLink {
    /// Peer node name; empty until the CONNECT of an accepted link is read
    identity: RwLock<Arc<str>>,
    role: LinkRole,
    remote_addr: Option<SocketAddr>,
    /// Filters the peer subscribed to over this link
    topics: Mutex<AHashSet<String>>,
    reader: tokio::sync::Mutex<Option<ReadState>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    encoder: Encoder,
    closed: AtomicBool,
    /// Wakes a read blocked on the socket when the link is closed
    close_notify: Notify,
    next_packet_id: AtomicU16,
    /// Bound on one packet write; a peer that stops reading is dropped
    write_timeout: Option<Duration>,
}

impl PeerLink {
    pub fn new<S: LinkStream>(stream: S, role: LinkRole, remote_addr: Option<SocketAddr>) -> Self {
        Self::with_max_packet_size(
            stream,
            role,
            remote_addr,
            crate::codec::DEFAULT_MAX_PACKET_SIZE,
        )
    }

    pub fn with_max_packet_size<S: LinkStream>(
        stream: S,
        role: LinkRole,
        remote_addr: Option<SocketAddr>,
        max_packet_size: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            identity: RwLock::new(Arc::from("")),
            role,
            remote_addr,
            topics: Mutex::new(AHashSet::new()),
            reader: tokio::sync::Mutex::new(Some(ReadState {
                reader: Box::new(reader),
                buf: BytesMut::with_capacity(4096),
                decoder: Decoder::new().with_max_packet_size(max_packet_size),
            })),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            encoder: Encoder::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            next_packet_id: AtomicU16::new(1),
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = Some(write_timeout);
        self
    }

    pub fn identity(&self) -> Arc<str> {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: &str) {
        *self.identity.write() = Arc::from(identity);
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Copy of the filters recorded against this link
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn add_topic(&self, topic: &str) -> bool {
        self.topics.lock().insert(topic.to_string())
    }

    pub fn remove_topic(&self, topic: &str) -> bool {
        self.topics.lock().remove(topic)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    /// Next nonzero packet identifier for SUBSCRIBE/UNSUBSCRIBE sent on this link
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the link closed and wake its read loop
    ///
    /// Idempotent. The read loop performs the disconnect cleanup and shuts
    /// the socket down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Cluster: closing link '{}'", self.identity());
            self.close_notify.notify_one();
        }
    }

    /// Read the next packet
    pub async fn read_packet(&self) -> Result<Packet, LinkError> {
        let mut guard = self.reader.lock().await;
        let state = guard.as_mut().ok_or(LinkError::Closed)?;

        loop {
            if let Some((packet, consumed)) = state.decoder.decode(&state.buf)? {
                state.buf.advance(consumed);
                trace!(
                    "Cluster: <- {} from '{}'",
                    packet.type_name(),
                    self.identity()
                );
                return Ok(packet);
            }

            if self.is_closed() {
                return Err(LinkError::Closed);
            }

            let n = tokio::select! {
                n = state.reader.read_buf(&mut state.buf) => n?,
                _ = self.close_notify.notified() => return Err(LinkError::Closed),
            };
            if n == 0 {
                return Err(LinkError::PeerClosed);
            }
        }
    }

    /// Encode and send one packet
    pub async fn write_packet(&self, packet: &Packet) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }

        let mut buf = BytesMut::with_capacity(64);
        self.encoder.encode(packet, &mut buf)?;

        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(LinkError::Closed)?;
            writer.write_all(&buf).await?;
            writer.flush().await?;
            Ok::<(), LinkError>(())
        };

        match self.write_timeout {
            Some(limit) => match timeout(limit, write).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        "Cluster: write to '{}' blocked for {:?}, closing link",
                        self.identity(),
                        limit
                    );
                    self.close();
                    return Err(LinkError::Timeout);
                }
            },
            None => write.await?,
        }

        trace!("Cluster: -> {} to '{}'", packet.type_name(), self.identity());
        Ok(())
    }

    /// Close the link and release the socket
    pub async fn shutdown(&self) {
        self.close();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Cluster: shutdown of link '{}' failed: {}", self.identity(), e);
            }
        }
        self.reader.lock().await.take();
    }

    /// Feed every inbound packet to `processor` until the link fails or closes
    ///
    /// Any exit, clean or not, is processed as a DISCONNECT so the link is
    /// deregistered and its cluster subscriptions dropped.
    pub async fn run_read_loop(self: &Arc<Self>, processor: &Processor) {
        loop {
            match self.read_packet().await {
                Ok(Packet::Disconnect) => {
                    debug!("Cluster: peer '{}' sent DISCONNECT", self.identity());
                    break;
                }
                Ok(packet) => processor.process(self, packet).await,
                Err(LinkError::Closed) => break,
                Err(LinkError::PeerClosed) => {
                    debug!("Cluster: peer '{}' closed the connection", self.identity());
                    break;
                }
                Err(e) => {
                    warn!("Cluster: link '{}' read failed: {}", self.identity(), e);
                    break;
                }
            }
        }

        processor.process(self, Packet::Disconnect).await;
        self.shutdown().await;
    }
}

#[async_trait]
impl Subscriber for PeerLink {
    fn id(&self) -> Arc<str> {
        self.identity()
    }

    async fn deliver(&self, packet: &Packet) -> Result<(), DeliveryError> {
        self.write_packet(packet).await.map_err(DeliveryError::from)
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("identity", &self.identity())
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, Subscribe};
    use tokio::io::DuplexStream;

    fn pair() -> (PeerLink, PeerLink) {
        let (a, b) = tokio::io::duplex(4096);
        (
            PeerLink::new(a, LinkRole::Dialed, None),
            PeerLink::new(b, LinkRole::Accepted, None),
        )
    }

    #[tokio::test]
    async fn test_packets_cross_the_link() {
        let (a, b) = pair();

        a.write_packet(&Packet::Subscribe(Subscribe::single(1, "a/b")))
            .await
            .unwrap();
        a.write_packet(&Packet::Publish(Publish::new("a/b", "x")))
            .await
            .unwrap();

        assert_eq!(
            b.read_packet().await.unwrap(),
            Packet::Subscribe(Subscribe::single(1, "a/b"))
        );
        assert_eq!(
            b.read_packet().await.unwrap(),
            Packet::Publish(Publish::new("a/b", "x"))
        );
    }

    #[tokio::test]
    async fn test_packet_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0xC0])
            .read(&[0x00, 0xD0])
            .read(&[0x00])
            .build();
        let link = PeerLink::new(stream, LinkRole::Dialed, None);

        assert_eq!(link.read_packet().await.unwrap(), Packet::PingReq);
        assert_eq!(link.read_packet().await.unwrap(), Packet::PingResp);
        assert!(matches!(
            link.read_packet().await,
            Err(LinkError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_closes() {
        // The far end never reads and the pipe holds one byte
        let (near, _far) = tokio::io::duplex(1);
        let link = PeerLink::new(near, LinkRole::Dialed, None)
            .with_write_timeout(Duration::from_millis(50));

        assert!(matches!(
            link.write_packet(&Packet::PingReq).await,
            Err(LinkError::Timeout)
        ));
        assert!(link.is_closed());
        assert!(matches!(
            link.write_packet(&Packet::PingReq).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (a, _b) = pair();
        let a = Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_packet().await })
        };
        tokio::task::yield_now().await;
        a.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LinkError::Closed)));
        assert!(matches!(
            a.write_packet(&Packet::PingReq).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_observed_by_peer() {
        let (a, b) = pair();
        a.shutdown().await;
        assert!(matches!(b.read_packet().await, Err(LinkError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_topics_and_identity() {
        let (a, _b) = pair();
        assert_eq!(&*a.identity(), "");
        a.set_identity("edge-1");
        assert_eq!(&*a.id(), "edge-1");

        assert!(a.add_topic("a/b"));
        assert!(!a.add_topic("a/b"));
        assert!(a.has_topic("a/b"));
        assert_eq!(a.topic_count(), 1);
        assert!(a.remove_topic("a/b"));
        assert!(a.topics().is_empty());
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let (a, _peer) = idle_link();
        a.next_packet_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(a.next_packet_id(), u16::MAX);
        assert_eq!(a.next_packet_id(), 1);
    }

    fn idle_link() -> (PeerLink, DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        (PeerLink::new(a, LinkRole::Dialed, None), b)
    }
}

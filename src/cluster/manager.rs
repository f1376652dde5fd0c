//! Cluster Manager
//!
//! Owns the listener, the registry and the processor. Every configured peer
//! is dialed from the heartbeat; inbound links are accepted from any node
//! presenting a valid CONNECT. Either way the link is registered under the
//! peer's name, this node's topics are pushed to it, and its read loop runs
//! until it fails or is displaced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, ClusterNode};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, Subscribe, Unsubscribe};
use crate::topic::{ClusterTopicStore, LocalTopicStore};

use super::link::{LinkError, LinkRole, LinkStream, PeerLink};
use super::processor::Processor;
use super::registry::ClusterRegistry;
use super::stats::{ClusterStats, StatsSnapshot};
use super::tls;
use super::ClusterError;

/// How long `start` waits for the heartbeat to observe shutdown
const HEARTBEAT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Live link as reported by [`ClusterManager::peers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: Arc<str>,
    pub role: LinkRole,
    pub remote_addr: Option<SocketAddr>,
    /// Filters the peer subscribed to over this link
    pub topics: usize,
}

pub struct ClusterManager {
    pub(super) config: ClusterConfig,
    pub(super) registry: Arc<ClusterRegistry>,
    processor: Processor,
    pub(super) local: Arc<dyn LocalTopicStore>,
    cluster_topics: Arc<dyn ClusterTopicStore>,
    stats: Arc<ClusterStats>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    pub(super) shutdown: watch::Sender<bool>,
}

impl ClusterManager {
    /// Build a manager; TLS material is loaded here so a bad path fails early
    pub fn new(
        mut config: ClusterConfig,
        local: Arc<dyn LocalTopicStore>,
        cluster_topics: Arc<dyn ClusterTopicStore>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.normalize();

        let (acceptor, connector) = match config.tls {
            Some(ref tls_config) => (
                Some(tls::load_acceptor(tls_config)?),
                Some(tls::load_connector(tls_config)?),
            ),
            None => (None, None),
        };

        let registry = Arc::new(ClusterRegistry::new());
        let stats = Arc::new(ClusterStats::new());
        let processor = Processor::new(
            registry.clone(),
            local.clone(),
            cluster_topics.clone(),
            stats.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            registry,
            processor,
            local,
            cluster_topics,
            stats,
            acceptor,
            connector,
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the listener and heartbeat until [`close`](Self::close)
    ///
    /// Returns an error if the listen address cannot be bound or accepting
    /// fails; either stops the heartbeat as well.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClusterError::Bind { addr, source })?;

        info!(
            "Cluster: node '{}' listening on {} ({} configured peers{})",
            self.config.name,
            addr,
            self.config.nodes.len(),
            if self.acceptor.is_some() { ", TLS" } else { "" }
        );

        let mut heartbeat = tokio::spawn(self.clone().run_heartbeat());
        let mut shutdown = self.shutdown.subscribe();

        let result = tokio::select! {
            result = self.accept_loop(&listener) => result,
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        };

        if let Err(ref e) = result {
            error!("Cluster: listener stopped: {}", e);
            self.close();
        }
        match timeout(HEARTBEAT_STOP_TIMEOUT, &mut heartbeat).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Cluster: heartbeat task failed: {}", e),
            Err(_) => {
                warn!("Cluster: heartbeat did not stop in time, aborting it");
                heartbeat.abort();
            }
        }

        info!("Cluster: node '{}' stopped", self.config.name);
        result
    }

    /// Stop the listener and heartbeat; existing links stay up
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> Result<(), ClusterError> {
        loop {
            let (stream, remote) = listener.accept().await.map_err(ClusterError::Accept)?;
            debug!("Cluster: connection from {}", remote);

            let this = self.clone();
            tokio::spawn(async move { this.accept_tcp(stream, remote).await });
        }
    }

    async fn accept_tcp(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cluster: set_nodelay for {} failed: {}", remote, e);
        }

        match self.acceptor {
            Some(ref acceptor) => {
                let handshake = timeout(self.config.handshake_timeout, acceptor.accept(stream)).await;
                match handshake {
                    Ok(Ok(tls_stream)) => self.accept_inbound(tls_stream, Some(remote)).await,
                    Ok(Err(e)) => {
                        ClusterStats::incr(&self.stats.handshake_failures);
                        warn!("Cluster: TLS handshake with {} failed: {}", remote, e);
                    }
                    Err(_) => {
                        ClusterStats::incr(&self.stats.handshake_failures);
                        warn!("Cluster: TLS handshake with {} timed out", remote);
                    }
                }
            }
            None => self.accept_inbound(stream, Some(remote)).await,
        }
    }

    /// Serve one inbound connection until it closes
    ///
    /// The first packet must be a CONNECT that validates; anything else
    /// closes the connection without touching the registry.
    pub async fn accept_inbound<S: LinkStream>(
        self: &Arc<Self>,
        stream: S,
        remote: Option<SocketAddr>,
    ) {
        let link = Arc::new(
            PeerLink::with_max_packet_size(
                stream,
                LinkRole::Accepted,
                remote,
                self.config.max_packet_size,
            )
            .with_write_timeout(self.config.write_timeout),
        );
        let peer = remote.map_or_else(|| "<unknown>".to_string(), |addr| addr.to_string());

        let connect = match timeout(self.config.handshake_timeout, link.read_packet()).await {
            Ok(Ok(Packet::Connect(connect))) => connect,
            Ok(Ok(other)) => {
                return self
                    .reject(&link, &format!("{} sent {} before CONNECT", peer, other.type_name()))
                    .await;
            }
            Ok(Err(e)) => return self.reject(&link, &format!("{}: {}", peer, e)).await,
            Err(_) => return self.reject(&link, &format!("{}: no CONNECT in time", peer)).await,
        };

        // A peer is addressed by name; an anonymous link cannot be registered
        if connect.client_id.is_empty() {
            let connack = ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::IdentifierRejected,
            };
            if let Err(e) = link.write_packet(&Packet::ConnAck(connack)).await {
                debug!("Cluster: CONNACK to {} failed: {}", peer, e);
            }
            return self.reject(&link, &format!("{} sent an empty identity", peer)).await;
        }

        let return_code = self.processor.process_connect(&link, &connect).await;
        if !return_code.is_accepted() {
            return self
                .reject(&link, &format!("{} refused: {}", peer, return_code))
                .await;
        }

        link.set_identity(&connect.client_id);
        ClusterStats::incr(&self.stats.links_accepted);
        info!("Cluster: accepted link from '{}' ({})", connect.client_id, peer);

        self.register(link).await;
    }

    /// Dial a configured peer and serve the link until it closes
    ///
    /// Failures are logged and abandoned; the next heartbeat tick retries.
    pub async fn dial_outbound(self: &Arc<Self>, node: &ClusterNode) {
        let link = match self.connect_peer(node).await {
            Ok(link) => link,
            Err(e) => {
                ClusterStats::incr(&self.stats.dial_failures);
                warn!("Cluster: dial to '{}' at {} failed: {}", node.name, node.host, e);
                return;
            }
        };

        ClusterStats::incr(&self.stats.links_dialed);
        info!("Cluster: dialed '{}' at {}", node.name, node.host);

        self.register(Arc::new(link)).await;
    }

    async fn connect_peer(&self, node: &ClusterNode) -> Result<PeerLink, LinkError> {
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(&node.host)).await??;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr().ok();
        let max_packet_size = self.config.max_packet_size;

        let link = if self.config.node_uses_tls(node) {
            let connector = self
                .connector
                .as_ref()
                .ok_or_else(|| LinkError::Handshake("[cluster.tls] is not configured".into()))?;
            let server_name =
                tls::server_name(&node.host).map_err(|e| LinkError::Handshake(e.to_string()))?;
            let tls_stream = timeout(
                self.config.dial_timeout,
                connector.connect(server_name, stream),
            )
            .await??;
            PeerLink::with_max_packet_size(tls_stream, LinkRole::Dialed, remote, max_packet_size)
        } else {
            PeerLink::with_max_packet_size(stream, LinkRole::Dialed, remote, max_packet_size)
        }
        .with_write_timeout(self.config.write_timeout);

        link.set_identity(&node.name);
        let connect = Connect::handshake(&self.config.name);
        link.write_packet(&Packet::Connect(Box::new(connect))).await?;
        Ok(link)
    }

    /// Displace any previous link for the identity, sync topics, run the read loop
    async fn register(self: &Arc<Self>, link: Arc<PeerLink>) {
        let identity = link.identity();
        if self.registry.displace(&identity, link.clone()).is_some() {
            ClusterStats::incr(&self.stats.links_displaced);
        }

        self.sync_topics(&identity).await;
        link.run_read_loop(&self.processor).await;
        debug!("Cluster: link to '{}' ({}) ended", identity, link.role());
    }

    async fn reject(&self, link: &PeerLink, reason: &str) {
        ClusterStats::incr(&self.stats.handshake_failures);
        warn!("Cluster: rejected inbound link: {}", reason);
        link.shutdown().await;
    }

    /// Send a locally published message to every peer subscribed to its topic
    ///
    /// Each peer link gets at most one QoS 0 copy. Returns the number of
    /// links written.
    pub async fn forward_publish(&self, publish: &Publish) -> usize {
        let subscribers = self.cluster_topics.subscribers_of(&publish.topic);
        if subscribers.is_empty() {
            return 0;
        }

        let packet = Packet::Publish(publish.to_qos0());
        let mut seen: AHashSet<Arc<str>> = AHashSet::with_capacity(subscribers.len());
        let mut forwarded = 0;

        for subscriber in subscribers {
            let id = subscriber.id();
            if !seen.insert(id.clone()) {
                continue;
            }
            match subscriber.deliver(&packet).await {
                Ok(()) => {
                    ClusterStats::incr(&self.stats.messages_forwarded);
                    forwarded += 1;
                }
                Err(e) => warn!(
                    "Cluster: forwarding '{}' to '{}' failed: {}",
                    publish.topic, id, e
                ),
            }
        }
        forwarded
    }

    /// Announce a new local filter to every live peer
    pub async fn notify_subscribe(&self, filter: &str) -> usize {
        let mut notified = 0;
        for link in self.registry.snapshot() {
            let subscribe = Subscribe::single(link.next_packet_id(), filter);
            match link.write_packet(&Packet::Subscribe(subscribe)).await {
                Ok(()) => notified += 1,
                Err(e) => warn!(
                    "Cluster: SUBSCRIBE '{}' to '{}' failed: {}",
                    filter,
                    link.identity(),
                    e
                ),
            }
        }
        notified
    }

    /// Withdraw a local filter from every live peer
    pub async fn notify_unsubscribe(&self, filter: &str) -> usize {
        let mut notified = 0;
        for link in self.registry.snapshot() {
            let unsubscribe = Unsubscribe {
                packet_id: link.next_packet_id(),
                filters: vec![filter.to_string()],
            };
            match link.write_packet(&Packet::Unsubscribe(unsubscribe)).await {
                Ok(()) => notified += 1,
                Err(e) => warn!(
                    "Cluster: UNSUBSCRIBE '{}' to '{}' failed: {}",
                    filter,
                    link.identity(),
                    e
                ),
            }
        }
        notified
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|link| PeerInfo {
                identity: link.identity(),
                role: link.role(),
                remote_addr: link.remote_addr(),
                topics: link.topic_count(),
            })
            .collect();
        peers.sort_by(|a, b| a.identity.cmp(&b.identity));
        peers
    }
}

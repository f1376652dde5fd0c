//! Message Processor
//!
//! Interprets packets arriving on any peer link. Holds no per-peer state:
//! everything it mutates lives in the registry and the topic stores.
//!
//! Reply write failures are logged and abandoned. A lost acknowledgment
//! surfaces to the peer as a timeout and the heartbeat re-establishes state.

use std::sync::Arc;

use ahash::AHashSet;
use tracing::{debug, trace, warn};

use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubAckReturnCode,
    Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::{validate_topic_filter, ClusterTopicStore, LocalTopicStore, SubscriberHandle};

use super::link::PeerLink;
use super::registry::ClusterRegistry;
use super::stats::ClusterStats;

#[derive(Clone)]
pub struct Processor {
    registry: Arc<ClusterRegistry>,
    local: Arc<dyn LocalTopicStore>,
    cluster: Arc<dyn ClusterTopicStore>,
    stats: Arc<ClusterStats>,
}

impl Processor {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        local: Arc<dyn LocalTopicStore>,
        cluster: Arc<dyn ClusterTopicStore>,
        stats: Arc<ClusterStats>,
    ) -> Self {
        Self {
            registry,
            local,
            cluster,
            stats,
        }
    }

    /// Dispatch one inbound packet
    pub async fn process(&self, link: &Arc<PeerLink>, packet: Packet) {
        match packet {
            Packet::Connect(connect) => {
                self.process_connect(link, &connect).await;
            }
            Packet::Publish(publish) => self.process_publish(&publish).await,
            Packet::Subscribe(subscribe) => self.process_subscribe(link, &subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                self.process_unsubscribe(link, &unsubscribe).await
            }
            Packet::PingReq => self.reply(link, &Packet::PingResp).await,
            Packet::Disconnect => self.process_disconnect(link).await,
            Packet::ConnAck(connack) => {
                debug!(
                    "Cluster: CONNACK from '{}': {}",
                    link.identity(),
                    connack.return_code
                );
            }
            // QoS 0 only: acknowledgments need no action
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => {
                trace!(
                    "Cluster: ignoring {} from '{}'",
                    packet.type_name(),
                    link.identity()
                );
            }
        }
    }

    /// Answer a CONNECT and return the code sent back
    ///
    /// Binding the identity and registering the link is up to the caller.
    pub async fn process_connect(&self, link: &PeerLink, connect: &Connect) -> ConnectReturnCode {
        let return_code = connect.validate();
        let connack = ConnAck {
            session_present: return_code.is_accepted() && connect.clean_session,
            return_code,
        };
        self.reply(link, &Packet::ConnAck(connack)).await;
        return_code
    }

    /// Deliver a publication from a peer to local subscribers
    ///
    /// A subscriber matched by several filters receives one copy. A retained
    /// publication also drops this node's retained copy of the topic so only
    /// one retained message per topic survives in the mesh.
    pub async fn process_publish(&self, publish: &Publish) {
        let subscribers = self.local.subscribers_of(&publish.topic);
        let packet = Packet::Publish(publish.to_qos0());

        let mut delivered: AHashSet<Arc<str>> = AHashSet::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let id = subscriber.id();
            if !delivered.insert(id.clone()) {
                continue;
            }
            if let Err(e) = subscriber.deliver(&packet).await {
                warn!(
                    "Cluster: delivery of '{}' to '{}' failed: {}",
                    publish.topic, id, e
                );
            }
            ClusterStats::incr(&self.stats.messages_sent);
        }

        if publish.retain {
            self.local.remove_retained(&publish.topic);
        }
    }

    async fn process_subscribe(&self, link: &Arc<PeerLink>, subscribe: &Subscribe) {
        let return_codes = subscribe
            .subscriptions
            .iter()
            .map(|sub| match validate_topic_filter(&sub.filter) {
                Ok(()) => SubAckReturnCode::Granted(QoS::AtMostOnce),
                Err(reason) => {
                    warn!(
                        "Cluster: '{}' subscribed to invalid filter '{}': {}",
                        link.identity(),
                        sub.filter,
                        reason
                    );
                    SubAckReturnCode::Failure
                }
            })
            .collect::<Vec<_>>();

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            return_codes: return_codes.clone(),
        };
        self.reply(link, &Packet::SubAck(suback)).await;

        let identity = link.identity();
        let handle: SubscriberHandle = link.clone();
        for (sub, code) in subscribe.subscriptions.iter().zip(return_codes) {
            if code == SubAckReturnCode::Failure {
                continue;
            }

            // Record on the link first so a concurrent disconnect sees the topic
            link.add_topic(&sub.filter);
            self.cluster
                .subscribe(&sub.filter, identity.clone(), handle.clone());
            debug!("Cluster: '{}' subscribed to '{}'", identity, sub.filter);

            for retained in self.local.search_retained(&sub.filter) {
                let replay = Packet::Publish(Publish {
                    retain: true,
                    ..retained.to_qos0()
                });
                self.reply(link, &replay).await;
            }
        }
    }

    async fn process_unsubscribe(&self, link: &PeerLink, unsubscribe: &Unsubscribe) {
        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
        };
        self.reply(link, &Packet::UnsubAck(unsuback)).await;

        let identity = link.identity();
        for filter in &unsubscribe.filters {
            self.cluster.unsubscribe(filter, &identity);
            link.remove_topic(filter);
            debug!("Cluster: '{}' unsubscribed from '{}'", identity, filter);
        }
    }

    /// Deregister and close `link`, then drop every cluster subscription it holds
    ///
    /// Runs for an explicit DISCONNECT and whenever a read loop ends.
    pub async fn process_disconnect(&self, link: &Arc<PeerLink>) {
        let identity = link.identity();
        debug!("Cluster: processing disconnect of '{}'", identity);

        self.registry.remove_if_current(link);
        link.close();

        // A displaced link shares its identity with the replacement; leave
        // the subscriptions the replacement already holds
        let successor = self
            .registry
            .get(&identity)
            .filter(|current| !Arc::ptr_eq(current, link));

        for topic in link.topics() {
            link.remove_topic(&topic);
            let taken_over = successor
                .as_ref()
                .is_some_and(|current| current.has_topic(&topic));
            if !taken_over {
                self.cluster.unsubscribe(&topic, &identity);
            }
        }
    }

    async fn reply(&self, link: &PeerLink, packet: &Packet) {
        if let Err(e) = link.write_packet(packet).await {
            warn!(
                "Cluster: failed to send {} to '{}': {}",
                packet.type_name(),
                link.identity(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::link::LinkRole;
    use crate::topic::{DeliveryError, MemoryTopicStore, Subscriber, SubscriptionTree};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Client {
        id: Arc<str>,
        received: Mutex<Vec<Packet>>,
    }

    impl Client {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Arc::from(id),
                received: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().len()
        }
    }

    #[async_trait]
    impl Subscriber for Client {
        fn id(&self) -> Arc<str> {
            self.id.clone()
        }

        async fn deliver(&self, packet: &Packet) -> Result<(), DeliveryError> {
            self.received.lock().push(packet.clone());
            Ok(())
        }
    }

    struct Fixture {
        processor: Processor,
        registry: Arc<ClusterRegistry>,
        local: Arc<MemoryTopicStore>,
        cluster: Arc<SubscriptionTree>,
        stats: Arc<ClusterStats>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ClusterRegistry::new());
        let local = Arc::new(MemoryTopicStore::new());
        let cluster = Arc::new(SubscriptionTree::new());
        let stats = Arc::new(ClusterStats::new());
        Fixture {
            processor: Processor::new(
                registry.clone(),
                local.clone(),
                cluster.clone(),
                stats.clone(),
            ),
            registry,
            local,
            cluster,
            stats,
        }
    }

    /// Link under test plus the far end used to read replies
    fn link(identity: &str) -> (Arc<PeerLink>, PeerLink) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let link = Arc::new(PeerLink::new(near, LinkRole::Accepted, None));
        link.set_identity(identity);
        (link, PeerLink::new(far, LinkRole::Dialed, None))
    }

    fn retained(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            retain: true,
            ..Publish::new(topic, Bytes::from_static(payload))
        }
    }

    #[tokio::test]
    async fn test_publish_delivers_once_per_subscriber() {
        let f = fixture();
        let c1 = Client::new("c1");
        let c2 = Client::new("c2");
        f.local.subscribe("a/+", c1.clone());
        f.local.subscribe("a/#", c1.clone());
        f.local.subscribe("a/b", c1.clone());
        f.local.subscribe("a/b", c2.clone());
        f.local.subscribe("x/y", Client::new("c3"));

        let (peer, _far) = link("edge-1");
        f.processor
            .process(&peer, Packet::Publish(Publish::new("a/b", "21.5")))
            .await;

        assert_eq!(c1.count(), 1);
        assert_eq!(c2.count(), 1);
        assert_eq!(f.stats.messages_sent(), 2);
    }

    #[tokio::test]
    async fn test_inbound_publish_is_delivered_at_qos0() {
        let f = fixture();
        let c1 = Client::new("c1");
        f.local.subscribe("a/b", c1.clone());

        let publish = Publish {
            qos: QoS::AtLeastOnce,
            packet_id: Some(5),
            ..Publish::new("a/b", "x")
        };
        f.processor.process_publish(&publish).await;

        assert_eq!(
            c1.received.lock().as_slice(),
            &[Packet::Publish(Publish::new("a/b", "x"))]
        );
    }

    #[tokio::test]
    async fn test_retained_publish_removes_local_copy() {
        let f = fixture();
        f.local.retain(&retained("a/b", b"old"));
        f.local.retain(&retained("c/d", b"keep"));

        f.processor.process_publish(&retained("a/b", b"new")).await;
        assert!(f.local.retained().get("a/b").is_none());
        assert!(f.local.retained().get("c/d").is_some());

        // Seeing it again is a no-op
        f.processor.process_publish(&retained("a/b", b"new")).await;
        assert!(f.local.retained().get("a/b").is_none());
        assert_eq!(f.local.retained().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_acks_registers_and_replays_retained() {
        let f = fixture();
        f.local.retain(&retained("a/b", b"last"));
        let (peer, far) = link("edge-1");

        let subscribe = Subscribe {
            packet_id: 42,
            subscriptions: vec![
                crate::protocol::Subscription {
                    filter: "a/+".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                crate::protocol::Subscription {
                    filter: "bad/#/filter".to_string(),
                    qos: QoS::AtMostOnce,
                },
            ],
        };
        f.processor.process(&peer, Packet::Subscribe(subscribe)).await;

        assert_eq!(
            far.read_packet().await.unwrap(),
            Packet::SubAck(SubAck {
                packet_id: 42,
                return_codes: vec![
                    SubAckReturnCode::Granted(QoS::AtMostOnce),
                    SubAckReturnCode::Failure,
                ],
            })
        );
        assert_eq!(
            far.read_packet().await.unwrap(),
            Packet::Publish(retained("a/b", b"last"))
        );

        assert!(f.cluster.is_subscribed("a/+", "edge-1"));
        assert_eq!(f.cluster.filter_count(), 1);
        assert_eq!(peer.topics(), vec!["a/+".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_acks_and_removes() {
        let f = fixture();
        let (peer, far) = link("edge-1");
        f.processor
            .process(&peer, Packet::Subscribe(Subscribe::single(1, "a/b")))
            .await;
        far.read_packet().await.unwrap();

        f.processor
            .process(
                &peer,
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 2,
                    filters: vec!["a/b".to_string()],
                }),
            )
            .await;

        assert_eq!(
            far.read_packet().await.unwrap(),
            Packet::UnsubAck(UnsubAck { packet_id: 2 })
        );
        assert_eq!(f.cluster.filter_count(), 0);
        assert!(!peer.has_topic("a/b"));
    }

    #[tokio::test]
    async fn test_ping_and_connect_replies() {
        let f = fixture();
        let (peer, far) = link("edge-1");

        f.processor.process(&peer, Packet::PingReq).await;
        assert_eq!(far.read_packet().await.unwrap(), Packet::PingResp);

        let code = f
            .processor
            .process_connect(&peer, &Connect::handshake("edge-1"))
            .await;
        assert_eq!(code, ConnectReturnCode::Accepted);
        assert_eq!(
            far.read_packet().await.unwrap(),
            Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::Accepted,
            })
        );

        let bad = Connect {
            protocol_level: 5,
            ..Connect::handshake("edge-1")
        };
        let code = f.processor.process_connect(&peer, &bad).await;
        assert_eq!(code, ConnectReturnCode::UnacceptableProtocolVersion);
        assert_eq!(
            far.read_packet().await.unwrap(),
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::UnacceptableProtocolVersion,
            })
        );
    }

    #[tokio::test]
    async fn test_acks_are_ignored() {
        let f = fixture();
        let (peer, _far) = link("edge-1");
        f.registry.displace("edge-1", peer.clone());

        for packet in [
            Packet::PubAck(crate::protocol::PubAck { packet_id: 1 }),
            Packet::SubAck(SubAck {
                packet_id: 1,
                return_codes: vec![SubAckReturnCode::Granted(QoS::AtMostOnce)],
            }),
            Packet::UnsubAck(UnsubAck { packet_id: 1 }),
            Packet::PingResp,
        ] {
            f.processor.process(&peer, packet).await;
        }

        assert!(!peer.is_closed());
        assert!(f.registry.contains("edge-1"));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_link() {
        let f = fixture();
        let (peer, far) = link("edge-1");
        f.registry.displace("edge-1", peer.clone());

        for (id, filter) in [(1, "a/b"), (2, "c/d")] {
            f.processor
                .process(&peer, Packet::Subscribe(Subscribe::single(id, filter)))
                .await;
            far.read_packet().await.unwrap();
        }
        assert_eq!(f.cluster.filter_count(), 2);

        f.processor.process(&peer, Packet::Disconnect).await;

        assert!(f.cluster.subscribers_of("a/b").is_empty());
        assert!(f.cluster.subscribers_of("c/d").is_empty());
        assert!(peer.topics().is_empty());
        assert!(!f.registry.contains("edge-1"));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_displaced_link_keeps_successor_subscriptions() {
        let f = fixture();
        let (old, old_far) = link("edge-1");
        let (new, new_far) = link("edge-1");

        f.registry.displace("edge-1", old.clone());
        for (id, filter) in [(1, "a/b"), (2, "c/d")] {
            f.processor
                .process(&old, Packet::Subscribe(Subscribe::single(id, filter)))
                .await;
            old_far.read_packet().await.unwrap();
        }

        f.registry.displace("edge-1", new.clone());
        f.processor
            .process(&new, Packet::Subscribe(Subscribe::single(1, "a/b")))
            .await;
        new_far.read_packet().await.unwrap();

        f.processor.process(&old, Packet::Disconnect).await;

        let holders = f.cluster.subscribers_of("a/b");
        assert_eq!(holders.len(), 1);
        let expected: SubscriberHandle = new.clone();
        assert!(Arc::ptr_eq(&holders[0], &expected));
        assert!(f.cluster.subscribers_of("c/d").is_empty());
        assert!(Arc::ptr_eq(&f.registry.get("edge-1").unwrap(), &new));
    }
}

//! Topic synchronization
//!
//! After a link registers, this node advertises every locally subscribed
//! filter to the peer as a QoS 0 SUBSCRIBE, one filter per packet. SUBACKs
//! are not awaited; the processor ignores them when they arrive.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::{Packet, Subscribe};
use crate::topic::LocalTopicStore;

use super::manager::ClusterManager;
use super::registry::ClusterRegistry;

impl ClusterManager {
    /// Push local filters to every configured peer named `identity`
    ///
    /// Returns once each peer's SUBSCRIBEs are written, with the total sent.
    pub async fn sync_topics(&self, identity: &str) -> usize {
        let mut tasks = JoinSet::new();
        for node in self.config.nodes_named(identity) {
            let registry = self.registry.clone();
            let local = self.local.clone();
            let name = node.name.clone();
            tasks.spawn(async move { sync_peer(&registry, local.as_ref(), &name).await });
        }

        let mut sent = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(count) => sent += count,
                Err(e) => warn!("Cluster: topic sync task for '{}' failed: {}", identity, e),
            }
        }
        sent
    }
}

async fn sync_peer(registry: &ClusterRegistry, local: &dyn LocalTopicStore, name: &str) -> usize {
    let Some(link) = registry.get(name) else {
        debug!("Cluster: no live link to '{}', skipping topic sync", name);
        return 0;
    };

    let mut topics: Vec<Arc<str>> = Vec::new();
    local.range_topics(&mut |topic| {
        topics.push(Arc::from(topic));
        true
    });

    let mut sent = 0;
    for topic in &topics {
        let subscribe = Subscribe::single(link.next_packet_id(), topic);
        if let Err(e) = link.write_packet(&Packet::Subscribe(subscribe)).await {
            warn!(
                "Cluster: topic sync to '{}' stopped after {} of {}: {}",
                name,
                sent,
                topics.len(),
                e
            );
            return sent;
        }
        sent += 1;
    }

    info!("Cluster: synced {} topics to '{}'", sent, name);
    sent
}

//! Peer health checks
//!
//! Each tick recomputes every configured peer's state from the registry.
//! A missing peer is dialed in the background, a link this node dialed is
//! pinged, and a link the peer dialed is left to the peer's own heartbeat.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::protocol::Packet;

use super::link::LinkRole;
use super::manager::ClusterManager;

/// State of one configured peer as seen from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    /// No live link; the next check dials it
    Disconnected,
    /// Live link opened by this node; kept alive with PINGREQ
    ConnectedDialed,
    /// Live link opened by the peer
    ConnectedAccepted,
}

impl ClusterManager {
    pub fn peer_health(&self, name: &str) -> PeerHealth {
        match self.registry.get(name) {
            None => PeerHealth::Disconnected,
            Some(link) if link.is_closed() => PeerHealth::Disconnected,
            Some(link) => match link.role() {
                LinkRole::Dialed => PeerHealth::ConnectedDialed,
                LinkRole::Accepted => PeerHealth::ConnectedAccepted,
            },
        }
    }

    /// One heartbeat pass over every configured peer
    ///
    /// Dials and pings are spawned and not awaited, so one stalled peer
    /// cannot hold up the others. A ping write is bounded by the link's
    /// write timeout.
    pub async fn check_health(self: &Arc<Self>) {
        for node in &self.config.nodes {
            match self.peer_health(&node.name) {
                PeerHealth::Disconnected => {
                    debug!("Cluster: peer '{}' disconnected, dialing {}", node.name, node.host);
                    let this = self.clone();
                    let node = node.clone();
                    tokio::spawn(async move { this.dial_outbound(&node).await });
                }
                PeerHealth::ConnectedDialed => {
                    let Some(link) = self.registry.get(&node.name) else {
                        continue;
                    };
                    tokio::spawn(async move {
                        match link.write_packet(&Packet::PingReq).await {
                            Ok(()) => trace!("Cluster: pinged '{}'", link.identity()),
                            Err(e) => warn!("Cluster: ping to '{}' failed: {}", link.identity(), e),
                        }
                    });
                }
                PeerHealth::ConnectedAccepted => {}
            }
        }
    }

    /// Check immediately, then once per `heartbeat_interval` until shutdown
    pub(super) async fn run_heartbeat(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Cluster: heartbeat every {:?} over {} peers",
            self.config.heartbeat_interval,
            self.config.nodes.len()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    // An in-flight pass is abandoned on shutdown
                    tokio::select! {
                        _ = self.check_health() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        debug!("Cluster: heartbeat stopped");
    }
}

//! Cluster Module
//!
//! Full-mesh clustering between broker nodes over MQTT v3.1.1.
//!
//! # Architecture
//!
//! Every node lists its peers by name and address. A peer link is an
//! ordinary MQTT connection in which one node plays client:
//! - the dialing node sends CONNECT with its own name as client id
//! - both sides push their local filters as SUBSCRIBE over the link
//! - publications matching a peer's filters are forwarded as QoS 0 PUBLISH
//! - the dialing side keeps the link alive with PINGREQ from the heartbeat
//!
//! # Usage
//!
//! ```toml
//! # brokermesh.toml
//! [cluster]
//! name = "node-local"
//! listen = "0.0.0.0:7947"
//!
//! [[cluster.nodes]]
//! name = "edge-1"
//! host = "10.0.0.5:7947"
//! ```

mod heartbeat;
mod link;
mod manager;
mod processor;
mod registry;
mod stats;
mod sync;
mod tls;

use std::net::SocketAddr;

pub use heartbeat::PeerHealth;
pub use link::{LinkError, LinkRole, LinkStream, PeerLink};
pub use manager::{ClusterManager, PeerInfo};
pub use processor::Processor;
pub use registry::ClusterRegistry;
pub use stats::{ClusterStats, StatsSnapshot};
pub use tls::TlsError;

// Re-export cluster config
pub use crate::config::{ClusterConfig, ClusterNode, ClusterTlsConfig};

/// Fatal errors of a cluster node
#[derive(Debug)]
pub enum ClusterError {
    /// Listen address could not be bound
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// TLS material could not be loaded
    Tls(TlsError),
    /// Listener stopped accepting
    Accept(std::io::Error),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Bind { addr, source } => {
                write!(f, "Failed to bind cluster listener on {}: {}", addr, source)
            }
            ClusterError::Tls(e) => write!(f, "Cluster TLS error: {}", e),
            ClusterError::Accept(e) => write!(f, "Cluster accept failed: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Bind { source, .. } => Some(source),
            ClusterError::Tls(e) => Some(e),
            ClusterError::Accept(e) => Some(e),
        }
    }
}

impl From<TlsError> for ClusterError {
    fn from(e: TlsError) -> Self {
        ClusterError::Tls(e)
    }
}

//! Cluster Configuration
//!
//! This node's identity, where it listens for peers, and the static list of
//! peers it keeps links to.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

/// Mesh configuration for one node
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's name, sent as the client identifier when dialing peers
    /// Default: the machine's host name
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Address the peer listener binds to
    /// Default: 0.0.0.0:7947
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Period of the health check that dials missing peers and pings dialed links
    /// Default: 20s
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Time allowed to open a connection to a peer
    /// Default: 60s
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Time an accepted connection has to send its CONNECT
    /// Default: 10s
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Time a single packet write may block before the link is dropped
    /// Default: 10s
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Largest packet accepted from a peer, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Mutual TLS material; when set the listener only accepts TLS
    pub tls: Option<ClusterTlsConfig>,

    /// Peers this node maintains links to
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
}

/// A statically configured peer
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClusterNode {
    /// Peer name; must match the client identifier the peer dials us with
    pub name: String,
    /// "host:port" of the peer's cluster listener
    pub host: String,
    /// Dial with TLS (defaults to whether `[cluster.tls]` is configured)
    #[serde(default)]
    pub tls: Option<bool>,
}

/// TLS material for peer links (PEM files)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClusterTlsConfig {
    /// Listener certificate chain
    pub cert: String,
    /// Listener private key
    pub key: String,
    /// CA that signs every node's certificates
    pub ca_cert: String,
    /// Certificate presented when dialing (defaults to `cert`)
    #[serde(default)]
    pub client_cert: Option<String>,
    /// Key presented when dialing (defaults to `key`)
    #[serde(default)]
    pub client_key: Option<String>,
}

impl ClusterTlsConfig {
    /// Certificate and key used on dialed links
    pub fn client_identity(&self) -> (&str, &str) {
        (
            self.client_cert.as_deref().unwrap_or(&self.cert),
            self.client_key.as_deref().unwrap_or(&self.key),
        )
    }
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "brokermesh".to_string())
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 7947))
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_packet_size() -> usize {
    crate::codec::DEFAULT_MAX_PACKET_SIZE
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            listen: default_listen(),
            heartbeat_interval: default_heartbeat_interval(),
            dial_timeout: default_dial_timeout(),
            handshake_timeout: default_handshake_timeout(),
            write_timeout: default_write_timeout(),
            max_packet_size: default_max_packet_size(),
            tls: None,
            nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    /// Whether links dialed to `node` use TLS
    pub fn node_uses_tls(&self, node: &ClusterNode) -> bool {
        node.tls.unwrap_or(self.tls.is_some())
    }

    /// Configured peers whose name equals `identity`
    pub fn nodes_named<'a>(&'a self, identity: &'a str) -> impl Iterator<Item = &'a ClusterNode> {
        self.nodes.iter().filter(move |node| node.name == identity)
    }

    /// Strip surrounding whitespace from this node's and every peer's name
    ///
    /// Names are registry keys and CONNECT identifiers, so they are compared
    /// verbatim everywhere after this.
    pub fn normalize(&mut self) {
        let name = self.name.trim();
        if name.len() != self.name.len() {
            self.name = name.to_string();
        }
        for node in &mut self.nodes {
            let trimmed = node.name.trim();
            if trimmed.len() != node.name.len() {
                node.name = trimmed.to_string();
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("cluster.name cannot be empty".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("cluster.heartbeat_interval must be greater than 0".to_string());
        }
        if self.write_timeout.is_zero() {
            return Err("cluster.write_timeout must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            let name = node.name.trim();
            if name.is_empty() {
                return Err(format!("cluster node '{}' has an empty name", node.host));
            }
            if node.host.is_empty() {
                return Err(format!("cluster node '{}' has an empty host", name));
            }
            if name == self.name.trim() {
                return Err(format!(
                    "cluster node '{}' has the same name as this node",
                    name
                ));
            }
            if !seen.insert(name) {
                return Err(format!("cluster node '{}' is configured twice", name));
            }
            if node.tls == Some(true) && self.tls.is_none() {
                return Err(format!(
                    "cluster node '{}' requires TLS but [cluster.tls] is not configured",
                    name
                ));
            }
        }

        if let Some(ref tls) = self.tls {
            for (field, value) in [
                ("cert", &tls.cert),
                ("key", &tls.key),
                ("ca_cert", &tls.ca_cert),
            ] {
                if value.is_empty() {
                    return Err(format!("cluster.tls.{} is required", field));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn node(name: &str, host: &str) -> ClusterNode {
        ClusterNode {
            name: name.to_string(),
            host: host.to_string(),
            tls: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.name.is_empty());
        assert_eq!(config.listen.port(), 7947);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.dial_timeout, Duration::from_secs(60));
        assert!(config.nodes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_uses_tls() {
        let mut config = ClusterConfig::default();
        let mut peer = node("edge-1", "10.0.0.5:1883");
        assert!(!config.node_uses_tls(&peer));

        config.tls = Some(ClusterTlsConfig::default());
        assert!(config.node_uses_tls(&peer));

        peer.tls = Some(false);
        assert!(!config.node_uses_tls(&peer));
    }

    #[test]
    fn test_client_identity_falls_back_to_server_pair() {
        let mut tls = ClusterTlsConfig {
            cert: "server.pem".to_string(),
            key: "server.key".to_string(),
            ..Default::default()
        };
        assert_eq!(tls.client_identity(), ("server.pem", "server.key"));

        tls.client_cert = Some("client.pem".to_string());
        tls.client_key = Some("client.key".to_string());
        assert_eq!(tls.client_identity(), ("client.pem", "client.key"));
    }

    #[test]
    fn test_normalize_trims_names() {
        let mut config = ClusterConfig::default();
        config.name = " node-local\t".to_string();
        config.nodes = vec![node(" edge-1 ", "a:1"), node("edge-2", "b:1")];
        config.normalize();

        assert_eq!(config.name, "node-local");
        assert_eq!(config.nodes[0].name, "edge-1");
        assert!(config.validate().is_ok());

        let hosts: Vec<_> = config.nodes_named("edge-1").map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["a:1"]);
        assert_eq!(config.nodes_named("edge-3").count(), 0);
    }

    #[test]
    fn test_validate_rejects_bad_peers() {
        let mut config = ClusterConfig::default();
        config.name = "node-local".to_string();

        config.nodes = vec![node("edge-1", "a:1"), node("edge-1", "b:1")];
        assert!(config.validate().unwrap_err().contains("twice"));

        config.nodes = vec![node("node-local", "a:1")];
        assert!(config.validate().unwrap_err().contains("same name"));

        config.nodes = vec![node("", "a:1")];
        assert!(config.validate().is_err());

        config.nodes = vec![ClusterNode {
            tls: Some(true),
            ..node("edge-1", "a:1")
        }];
        assert!(config.validate().unwrap_err().contains("TLS"));
    }
}

//! brokermesh - cluster mesh layer for MQTT brokers
//!
//! Links broker nodes into a full mesh over plain MQTT v3.1.1 connections:
//! nodes exchange their subscribed filters, forward matching publications
//! at QoS 0 and re-dial lost peers from a heartbeat.
//!
//! The host broker plugs in through [`topic::LocalTopicStore`] and
//! [`topic::ClusterTopicStore`]; [`topic::MemoryTopicStore`] and
//! [`topic::SubscriptionTree`] are in-memory implementations.

pub mod cluster;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use cluster::{ClusterError, ClusterManager, PeerHealth, PeerLink};
pub use config::Config;
pub use protocol::{Packet, QoS};
pub use topic::{ClusterTopicStore, LocalTopicStore, MemoryTopicStore, SubscriptionTree};

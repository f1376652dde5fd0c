//! Cluster Registry
//!
//! Identity -> live [`PeerLink`]. Registering over an existing identity
//! closes the superseded link inside the same map entry operation, so the
//! registry never holds two live links for one peer. When both nodes
//! reconnect at once, whichever registration lands last wins.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use super::link::PeerLink;

#[derive(Default)]
pub struct ClusterRegistry {
    links: DashMap<String, Arc<PeerLink>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `link` under `identity`, closing and returning any link it replaces
    pub fn displace(&self, identity: &str, link: Arc<PeerLink>) -> Option<Arc<PeerLink>> {
        match self.links.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(link);
                if Arc::ptr_eq(&previous, entry.get()) {
                    return None;
                }
                info!(
                    "Cluster: link for '{}' displaced by a newer connection",
                    identity
                );
                previous.close();
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(link);
                None
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<PeerLink>> {
        self.links.get(identity).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.links.contains_key(identity)
    }

    /// Remove the entry for `link`'s identity only if it still points at `link`
    ///
    /// A displaced link tearing down must not evict its replacement.
    pub fn remove_if_current(&self, link: &Arc<PeerLink>) -> bool {
        let identity = link.identity();
        self.links
            .remove_if(&*identity, |_, current| Arc::ptr_eq(current, link))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Copy of every live link
    pub fn snapshot(&self) -> Vec<Arc<PeerLink>> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }
}

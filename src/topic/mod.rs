//! Topic matching and subscription stores
//!
//! The cluster layer talks to the host broker through two narrow stores:
//!
//! - [`LocalTopicStore`]: what clients on *this* node subscribe to, plus the
//!   retained messages. Inbound cluster publications are delivered from it
//!   and its filters are what the node advertises to peers.
//! - [`ClusterTopicStore`]: which peer links asked for which filters, used to
//!   forward local publications across the mesh.
//!
//! [`MemoryTopicStore`] and [`SubscriptionTree`] are the in-process
//! implementations used by the standalone binary and the tests.

mod retained;
mod trie;
pub mod validation;

pub use retained::RetainedStore;
pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{Packet, Publish};

/// Error returned by a subscriber that failed to take a packet
pub type DeliveryError = Box<dyn std::error::Error + Send + Sync>;

/// Something that can receive packets routed by topic: a local client
/// session or a peer link.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Identity used for de-duplication and unsubscribe
    fn id(&self) -> Arc<str>;

    async fn deliver(&self, packet: &Packet) -> Result<(), DeliveryError>;
}

pub type SubscriberHandle = Arc<dyn Subscriber>;

/// Subscriptions and retained messages of the local broker
pub trait LocalTopicStore: Send + Sync {
    /// Handles of every local subscription matching `topic`
    ///
    /// A subscriber holding several matching filters appears once per filter.
    fn subscribers_of(&self, topic: &str) -> Vec<SubscriberHandle>;

    /// Visit every subscribed filter until `f` returns false
    fn range_topics(&self, f: &mut dyn FnMut(&str) -> bool);

    /// Retained messages matching `filter`
    fn search_retained(&self, filter: &str) -> Vec<Publish>;

    fn remove_retained(&self, topic: &str);
}

/// Subscriptions held on behalf of peer links
pub trait ClusterTopicStore: Send + Sync {
    fn subscribe(&self, filter: &str, id: Arc<str>, handle: SubscriberHandle);

    fn unsubscribe(&self, filter: &str, id: &str);

    /// Handles of every cluster subscription matching `topic`
    fn subscribers_of(&self, topic: &str) -> Vec<SubscriberHandle>;
}

struct FilterEntry {
    filter: Arc<str>,
    subscribers: AHashMap<Arc<str>, SubscriberHandle>,
}

/// Filter -> subscribers map backed by a [`TopicTrie`]
///
/// One entry per `(filter, id)`: subscribing again under the same id
/// replaces the handle.
pub struct SubscriptionTree {
    trie: RwLock<TopicTrie<FilterEntry>>,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    pub fn subscribe(&self, filter: &str, id: Arc<str>, handle: SubscriberHandle) {
        let mut trie = self.trie.write();
        let entry = trie.get_or_insert_with(filter, || FilterEntry {
            filter: Arc::from(filter),
            subscribers: AHashMap::new(),
        });
        entry.subscribers.insert(id, handle);
    }

    /// Returns true if `id` was subscribed to `filter`
    pub fn unsubscribe(&self, filter: &str, id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(entry) = trie.get_mut(filter) else {
            return false;
        };

        let removed = entry.subscribers.remove(id).is_some();
        if entry.subscribers.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    pub fn subscribers_of(&self, topic: &str) -> Vec<SubscriberHandle> {
        let trie = self.trie.read();
        let mut result: SmallVec<[SubscriberHandle; 16]> = SmallVec::new();
        trie.matches(topic, |entry| {
            result.extend(entry.subscribers.values().cloned());
        });
        result.into_vec()
    }

    /// Whether `id` holds exactly `filter`
    pub fn is_subscribed(&self, filter: &str, id: &str) -> bool {
        self.trie
            .read()
            .get(filter)
            .is_some_and(|entry| entry.subscribers.contains_key(id))
    }

    pub fn for_each_filter(&self, f: &mut dyn FnMut(&str) -> bool) {
        self.trie.read().for_each(|entry| f(&*entry.filter));
    }

    /// Number of distinct filters
    pub fn filter_count(&self) -> usize {
        self.trie.read().len()
    }
}

impl Default for SubscriptionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTopicStore for SubscriptionTree {
    fn subscribe(&self, filter: &str, id: Arc<str>, handle: SubscriberHandle) {
        SubscriptionTree::subscribe(self, filter, id, handle);
    }

    fn unsubscribe(&self, filter: &str, id: &str) {
        SubscriptionTree::unsubscribe(self, filter, id);
    }

    fn subscribers_of(&self, topic: &str) -> Vec<SubscriberHandle> {
        SubscriptionTree::subscribers_of(self, topic)
    }
}

/// In-memory local broker state: client subscriptions and retained messages
#[derive(Default)]
pub struct MemoryTopicStore {
    subscriptions: SubscriptionTree,
    retained: RetainedStore,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: &str, handle: SubscriberHandle) {
        self.subscriptions.subscribe(filter, handle.id(), handle);
    }

    pub fn unsubscribe(&self, filter: &str, id: &str) -> bool {
        self.subscriptions.unsubscribe(filter, id)
    }

    pub fn retain(&self, publish: &Publish) {
        self.retained.retain(publish);
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn subscriptions(&self) -> &SubscriptionTree {
        &self.subscriptions
    }
}

impl LocalTopicStore for MemoryTopicStore {
    fn subscribers_of(&self, topic: &str) -> Vec<SubscriberHandle> {
        self.subscriptions.subscribers_of(topic)
    }

    fn range_topics(&self, f: &mut dyn FnMut(&str) -> bool) {
        self.subscriptions.for_each_filter(f);
    }

    fn search_retained(&self, filter: &str) -> Vec<Publish> {
        self.retained.search(filter)
    }

    fn remove_retained(&self, topic: &str) {
        self.retained.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        id: Arc<str>,
        received: Mutex<Vec<Packet>>,
    }

    impl Recorder {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Arc::from(id),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        fn id(&self) -> Arc<str> {
            self.id.clone()
        }

        async fn deliver(&self, packet: &Packet) -> Result<(), DeliveryError> {
            self.received.lock().push(packet.clone());
            Ok(())
        }
    }

    fn ids(handles: &[SubscriberHandle]) -> Vec<String> {
        let mut ids: Vec<String> = handles.iter().map(|h| h.id().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_overlapping_filters_report_each_match() {
        let tree = SubscriptionTree::new();
        let a = Recorder::new("a");
        tree.subscribe("x/+", a.id(), a.clone());
        tree.subscribe("x/#", a.id(), a.clone());
        tree.subscribe("x/y", Arc::from("b"), Recorder::new("b"));

        assert_eq!(ids(&tree.subscribers_of("x/y")), vec!["a", "a", "b"]);
        assert_eq!(ids(&tree.subscribers_of("x")), vec!["a"]);
        assert!(tree.subscribers_of("z").is_empty());
    }

    #[test]
    fn test_resubscribe_replaces_handle() {
        let tree = SubscriptionTree::new();
        let first = Recorder::new("peer");
        let second = Recorder::new("peer");
        tree.subscribe("a/b", Arc::from("peer"), first.clone());
        tree.subscribe("a/b", Arc::from("peer"), second.clone());

        let handles = tree.subscribers_of("a/b");
        assert_eq!(handles.len(), 1);
        let expected: SubscriberHandle = second;
        assert!(Arc::ptr_eq(&handles[0], &expected));
    }

    #[test]
    fn test_unsubscribe_drops_empty_filter() {
        let tree = SubscriptionTree::new();
        tree.subscribe("a/b", Arc::from("p1"), Recorder::new("p1"));
        tree.subscribe("a/b", Arc::from("p2"), Recorder::new("p2"));

        assert!(tree.unsubscribe("a/b", "p1"));
        assert!(!tree.unsubscribe("a/b", "p1"));
        assert!(tree.is_subscribed("a/b", "p2"));
        assert_eq!(tree.filter_count(), 1);

        assert!(tree.unsubscribe("a/b", "p2"));
        assert_eq!(tree.filter_count(), 0);
        assert!(!tree.unsubscribe("never/subscribed", "p1"));
    }

    #[test]
    fn test_memory_store_range_topics() {
        let store = MemoryTopicStore::new();
        store.subscribe("a/b", Recorder::new("c1"));
        store.subscribe("c/#", Recorder::new("c2"));
        store.subscribe("a/b", Recorder::new("c3"));

        let mut topics = Vec::new();
        store.range_topics(&mut |topic| {
            topics.push(topic.to_string());
            true
        });
        topics.sort();
        assert_eq!(topics, vec!["a/b", "c/#"]);
    }

    #[tokio::test]
    async fn test_deliver_through_handle() {
        let store = MemoryTopicStore::new();
        let client = Recorder::new("c1");
        store.subscribe("a/+", client.clone());

        let packet = Packet::Publish(Publish::new("a/b", "hello"));
        for handle in store.subscribers_of("a/b") {
            handle.deliver(&packet).await.unwrap();
        }
        assert_eq!(client.received.lock().as_slice(), &[packet]);
    }
}

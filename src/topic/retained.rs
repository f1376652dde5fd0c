//! Retained message store
//!
//! At most one retained publication per topic. Storing a retained message
//! with an empty payload clears the topic.

use dashmap::DashMap;

use super::validation::topic_matches_filter;
use crate::protocol::Publish;

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<String, Publish>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or clear) the retained message for `publish.topic`
    pub fn retain(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.messages.remove(&*publish.topic);
        } else {
            self.messages
                .insert(publish.topic.to_string(), publish.clone());
        }
    }

    /// Delete the retained message for `topic`; deleting twice is a no-op
    pub fn remove(&self, topic: &str) -> Option<Publish> {
        self.messages.remove(topic).map(|(_, publish)| publish)
    }

    pub fn get(&self, topic: &str) -> Option<Publish> {
        self.messages.get(topic).map(|entry| entry.value().clone())
    }

    /// Retained messages whose topic matches `filter`
    pub fn search(&self, filter: &str) -> Vec<Publish> {
        if !filter.contains(['+', '#']) {
            return self.get(filter).into_iter().collect();
        }

        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn retained(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            retain: true,
            ..Publish::new(topic, Bytes::from_static(payload))
        }
    }

    #[test]
    fn test_retain_replaces_and_clears() {
        let store = RetainedStore::new();
        store.retain(&retained("a/b", b"1"));
        store.retain(&retained("a/b", b"2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a/b").unwrap().payload, Bytes::from_static(b"2"));

        store.retain(&retained("a/b", b""));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = RetainedStore::new();
        store.retain(&retained("a/b", b"1"));

        assert!(store.remove("a/b").is_some());
        assert!(store.remove("a/b").is_none());
        assert!(store.get("a/b").is_none());
    }

    #[test]
    fn test_search_with_wildcards() {
        let store = RetainedStore::new();
        store.retain(&retained("a/b", b"1"));
        store.retain(&retained("a/c", b"2"));
        store.retain(&retained("x/y", b"3"));

        let mut topics: Vec<String> = store
            .search("a/+")
            .into_iter()
            .map(|p| p.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["a/b", "a/c"]);

        assert_eq!(store.search("#").len(), 3);
        assert_eq!(store.search("x/y").len(), 1);
        assert!(store.search("x/z").is_empty());
    }
}

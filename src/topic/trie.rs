//! Topic trie keyed by filter levels
//!
//! Stores one value per topic filter and answers "which filters match this
//! topic name" without scanning every filter. Wildcards get dedicated slots
//! on each node so a match walks at most three branches per level.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` at this depth
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie mapping filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Number of filters stored
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the value for `filter`, inserting one built by `init` if absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                // `#` is always the last level of a valid filter
                if node.multi_wildcard.is_none() {
                    self.len += 1;
                }
                return node.multi_wildcard.get_or_insert_with(init);
            }

            if level == "+" {
                node = node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()));
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if levels.peek().is_none() {
                break;
            }
        }

        if node.value.is_none() {
            self.len += 1;
        }
        node.value.get_or_insert_with(init)
    }

    /// Get the value stored for `filter`
    pub fn get(&self, filter: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            match level {
                "#" => return node.multi_wildcard.as_ref(),
                "+" => node = node.single_wildcard.as_deref()?,
                _ => node = node.children.get(level)?,
            }
            if levels.peek().is_none() {
                return node.value.as_ref();
            }
        }

        None
    }

    /// Get a mutable reference to the value stored for `filter`
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            match level {
                "#" => return node.multi_wildcard.as_mut(),
                "+" => node = node.single_wildcard.as_deref_mut()?,
                _ => node = node.children.get_mut(level)?,
            }
            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove the value stored for `filter`, pruning emptied branches
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let removed = Self::remove_at(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_mut()?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Call `callback` with the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics are not matched by a leading wildcard
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_at(&self.root, &levels, true, is_system_topic, &mut callback);
    }

    fn matches_at<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        at_root: bool,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(at_root && is_system_topic);

        // `a/#` also matches the parent level `a`
        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some((&level, rest)) = levels.split_first() else {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_at(child, rest, false, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_at(child, rest, false, is_system_topic, callback);
        }
    }

    /// Visit every stored value; stops early when `f` returns false
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&V) -> bool,
    {
        Self::for_each_at(&self.root, &mut f);
    }

    fn for_each_at<F>(node: &TrieNode<V>, f: &mut F) -> bool
    where
        F: FnMut(&V) -> bool,
    {
        for v in node.value.iter().chain(node.multi_wildcard.iter()) {
            if !f(v) {
                return false;
            }
        }

        if let Some(ref child) = node.single_wildcard {
            if !Self::for_each_at(child, f) {
                return false;
            }
        }

        node.children
            .values()
            .all(|child| Self::for_each_at(child, f))
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("test/topic", || 0) = 1;

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_wildcards() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("test/+", || 1);
        trie.get_or_insert_with("+/topic", || 2);
        trie.get_or_insert_with("+/+", || 3);
        trie.get_or_insert_with("#", || 4);
        trie.get_or_insert_with("test/#", || 5);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3, 4, 5]);
        assert_eq!(collect(&trie, "test"), vec![4, 5]);
        assert_eq!(collect(&trie, "test/topic/deep"), vec![4, 5]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("#", || 1);
        trie.get_or_insert_with("+/test", || 2);
        trie.get_or_insert_with("$SYS/#", || 3);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3]);
    }

    #[test]
    fn test_get_or_insert_keeps_existing() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("a/b", || 1) += 10;
        *trie.get_or_insert_with("a/b", || 100) += 1;

        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get_mut("a/b"), Some(&mut 12));
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("a/+/c", || 1);
        trie.get_or_insert_with("a/#", || 2);

        assert_eq!(trie.remove("a/+/c"), Some(1));
        assert_eq!(trie.remove("a/+/c"), None);
        assert_eq!(trie.len(), 1);
        assert_eq!(collect(&trie, "a/b/c"), vec![2]);

        assert_eq!(trie.remove("a/#"), Some(2));
        assert!(trie.is_empty());
        assert!(trie.root.is_empty());
    }

    #[test]
    fn test_for_each_stops_early() {
        let mut trie = TopicTrie::new();
        for (i, filter) in ["a", "b/+", "c/#", "d/e/f"].iter().enumerate() {
            trie.get_or_insert_with(filter, || i as i32);
        }

        let mut all = Vec::new();
        trie.for_each(|v| {
            all.push(*v);
            true
        });
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3]);

        let mut visited = 0;
        trie.for_each(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }
}

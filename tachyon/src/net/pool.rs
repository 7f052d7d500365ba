use crate::net::channel::ChannelId;
use hashbrown::HashMap;
use indexmap::IndexSet;

/// Reuse pool mapping an endpoint identifier to its live channels. Several
/// parallel channels to the same endpoint spread load; a non-pipeline
/// channel is checked out of the pool for the duration of one request, so a
/// channel is never simultaneously reusable and owned by a request.
pub struct NamedPool {
    map: HashMap<String, IndexSet<ChannelId>>,
}

impl NamedPool {
    pub fn new() -> NamedPool {
        NamedPool {
            map: HashMap::new(),
        }
    }

    /// Adds a channel under its identifier once the identifier is stable.
    pub fn insert(&mut self, identify: &str, channel: ChannelId) {
        self.map
            .entry(identify.to_string())
            .or_insert_with(IndexSet::new)
            .insert(channel);
    }

    /// The channel a new request should use, oldest entry first.
    pub fn first(&self, identify: &str) -> Option<ChannelId> {
        self.map
            .get(identify)
            .and_then(|set| set.get_index(0).copied())
    }

    /// Removes one channel, dropping the entry when the set empties.
    pub fn remove(&mut self, identify: &str, channel: ChannelId) -> bool {
        let mut removed = false;
        let mut empty = false;
        if let Some(set) = self.map.get_mut(identify) {
            removed = set.shift_remove(&channel);
            empty = set.is_empty();
        }
        if empty {
            self.map.remove(identify);
        }
        removed
    }

    /// Drops the whole entry, returning the channels it held.
    pub fn discard(&mut self, identify: &str) -> Vec<ChannelId> {
        self.map
            .remove(identify)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, identify: &str) -> usize {
        self.map.get(identify).map(IndexSet::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for NamedPool {
    fn default() -> NamedPool {
        NamedPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_reuse_order() {
        let mut pool = NamedPool::new();
        pool.insert("10.0.0.1:7000", 3);
        pool.insert("10.0.0.1:7000", 8);

        assert_eq!(pool.first("10.0.0.1:7000"), Some(3));
        assert_eq!(pool.len("10.0.0.1:7000"), 2);
    }

    #[test]
    fn test_checkout_removes_single_entry() {
        let mut pool = NamedPool::new();
        pool.insert("10.0.0.1:7000", 3);

        assert!(pool.remove("10.0.0.1:7000", 3));
        assert_eq!(pool.first("10.0.0.1:7000"), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut pool = NamedPool::new();
        pool.insert("10.0.0.1:7000", 3);

        assert!(!pool.remove("10.0.0.1:7000", 4));
        assert!(!pool.remove("10.0.0.2:7000", 3));
        assert_eq!(pool.len("10.0.0.1:7000"), 1);
    }

    #[test]
    fn test_discard_returns_all() {
        let mut pool = NamedPool::new();
        pool.insert("10.0.0.1:7000", 3);
        pool.insert("10.0.0.1:7000", 8);

        let dropped = pool.discard("10.0.0.1:7000");

        assert_eq!(dropped, [3, 8]);
        assert!(pool.is_empty());
    }
}

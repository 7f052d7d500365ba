//! Session/node registry: maps logical node types to endpoint identifiers,
//! tracks endpoint health and stores per-endpoint credentials and channel
//! options for the dispatcher's auto-connect path.

use crate::net::channel::ChannelOption;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Minimum seconds between liveness probes of one failed endpoint.
const PROBE_INTERVAL: f64 = 2.0;

/// Selection factor for hashed routing: an integer shard key or a string
/// hashed to one.
pub enum HashFactor<'a> {
    Integer(u64),
    Text(&'a str),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuthRecord {
    pub auth: String,
    pub password: String,
}

struct NodeSet {
    endpoints: IndexSet<String>,
    cursor: usize,
}

pub struct Registry {
    node_types: HashMap<String, NodeSet>,
    failed: HashMap<String, f64>,
    auth: HashMap<String, AuthRecord>,
    options: HashMap<String, ChannelOption>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            node_types: HashMap::new(),
            failed: HashMap::new(),
            auth: HashMap::new(),
            options: HashMap::new(),
        }
    }

    pub fn add_node(&mut self, node_type: &str, identify: &str) {
        self.node_types
            .entry(node_type.to_string())
            .or_insert_with(|| NodeSet {
                endpoints: IndexSet::new(),
                cursor: 0,
            })
            .endpoints
            .insert(identify.to_string());
    }

    pub fn del_node(&mut self, node_type: &str, identify: &str) {
        let mut empty = false;
        if let Some(set) = self.node_types.get_mut(node_type) {
            set.endpoints.shift_remove(identify);
            empty = set.endpoints.is_empty();
        }
        if empty {
            self.node_types.remove(node_type);
        }

        // An endpoint nobody references anymore cannot stay failed.
        if !self.is_known(identify) {
            self.failed.remove(identify);
        }
    }

    pub fn is_node_type(&self, identify: &str, node_type: &str) -> bool {
        self.node_types
            .get(node_type)
            .map(|set| set.endpoints.contains(identify))
            .unwrap_or(false)
    }

    fn is_known(&self, identify: &str) -> bool {
        self.node_types
            .values()
            .any(|set| set.endpoints.contains(identify))
    }

    pub fn node_failed(&mut self, identify: &str) {
        self.failed.entry(identify.to_string()).or_insert(0.0);
    }

    pub fn node_recover(&mut self, identify: &str) {
        self.failed.remove(identify);
    }

    pub fn is_failed(&self, identify: &str) -> bool {
        self.failed.contains_key(identify)
    }

    /// Failed endpoints due for a liveness probe at `now`. Each returned
    /// endpoint has its probe stamp advanced so the caller can fire exactly
    /// one probe per interval.
    pub fn detect(&mut self, now: f64) -> Vec<String> {
        let mut due = Vec::new();
        for (identify, last_probe) in self.failed.iter_mut() {
            if now - *last_probe >= PROBE_INTERVAL {
                *last_probe = now;
                due.push(identify.clone());
            }
        }
        due
    }

    /// Round-robin selection over a node type, skipping failed endpoints.
    /// Falls back to plain rotation when every endpoint is failed.
    pub fn select(&mut self, node_type: &str) -> Option<String> {
        let failed: &HashMap<String, f64> = &self.failed;
        let set = self.node_types.get_mut(node_type)?;
        if set.endpoints.is_empty() {
            return None;
        }

        for _ in 0..set.endpoints.len() {
            set.cursor = (set.cursor + 1) % set.endpoints.len();
            let candidate = set.endpoints.get_index(set.cursor)?;
            if !failed.contains_key(candidate) {
                return Some(candidate.clone());
            }
        }

        set.cursor = (set.cursor + 1) % set.endpoints.len();
        set.endpoints.get_index(set.cursor).cloned()
    }

    /// Stable hashed selection: the same factor always lands on the same
    /// endpoint while the set is unchanged.
    pub fn select_by_hash(&self, node_type: &str, factor: HashFactor) -> Option<String> {
        let set = self.node_types.get(node_type)?;
        if set.endpoints.is_empty() {
            return None;
        }

        let shard = match factor {
            HashFactor::Integer(value) => value,
            HashFactor::Text(text) => {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                hasher.finish()
            }
        };

        let index = (shard % set.endpoints.len() as u64) as usize;
        set.endpoints.get_index(index).cloned()
    }

    pub fn broadcast(&self, node_type: &str) -> Vec<String> {
        self.node_types
            .get(node_type)
            .map(|set| set.endpoints.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_auth(&mut self, identify: &str, auth: &str, password: &str) {
        self.auth.insert(
            identify.to_string(),
            AuthRecord {
                auth: auth.to_string(),
                password: password.to_string(),
            },
        );
    }

    pub fn auth(&self, identify: &str) -> Option<&AuthRecord> {
        self.auth.get(identify)
    }

    pub fn set_channel_option(&mut self, identify: &str, option: ChannelOption) {
        self.options.insert(identify.to_string(), option);
    }

    pub fn channel_option(&self, identify: &str) -> Option<&ChannelOption> {
        self.options.get(identify)
    }

    /// Failed endpoints that are not referenced by any node type, pruned.
    pub fn prune_failed(&mut self) {
        let known: HashSet<String> = self
            .node_types
            .values()
            .flat_map(|set| set.endpoints.iter().cloned())
            .collect();
        self.failed.retain(|identify, _| known.contains(identify));
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_nodes() -> Registry {
        let mut registry = Registry::new();
        registry.add_node("CACHE", "10.0.0.1:6379");
        registry.add_node("CACHE", "10.0.0.2:6379");
        registry.add_node("CACHE", "10.0.0.3:6379");
        registry
    }

    #[test]
    fn test_select_round_robin_cycles() {
        let mut registry = registry_with_nodes();

        let picks: Vec<_> = (0..3).filter_map(|_| registry.select("CACHE")).collect();

        assert_eq!(picks.len(), 3);
        let unique: HashSet<_> = picks.iter().cloned().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_select_skips_failed() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.1:6379");
        registry.node_failed("10.0.0.3:6379");

        for _ in 0..6 {
            assert_eq!(registry.select("CACHE").unwrap(), "10.0.0.2:6379");
        }
    }

    #[test]
    fn test_select_all_failed_still_yields() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.1:6379");
        registry.node_failed("10.0.0.2:6379");
        registry.node_failed("10.0.0.3:6379");

        assert!(registry.select("CACHE").is_some());
    }

    #[test]
    fn test_select_by_hash_is_stable() {
        let registry = registry_with_nodes();

        let first = registry.select_by_hash("CACHE", HashFactor::Text("user-123"));
        let second = registry.select_by_hash("CACHE", HashFactor::Text("user-123"));

        assert_eq!(first, second);
        assert_eq!(
            registry.select_by_hash("CACHE", HashFactor::Integer(4)),
            registry.select_by_hash("CACHE", HashFactor::Integer(7)),
        );
    }

    #[test]
    fn test_detect_respects_probe_interval() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.1:6379");

        assert_eq!(registry.detect(100.0), ["10.0.0.1:6379"]);
        assert!(registry.detect(101.0).is_empty());
        assert_eq!(registry.detect(102.5), ["10.0.0.1:6379"]);
    }

    #[test]
    fn test_recover_clears_failed() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.2:6379");
        assert!(registry.is_failed("10.0.0.2:6379"));

        registry.node_recover("10.0.0.2:6379");

        assert!(!registry.is_failed("10.0.0.2:6379"));
    }

    #[test]
    fn test_del_node_drops_failed_entry() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.2:6379");

        registry.del_node("CACHE", "10.0.0.2:6379");

        assert!(!registry.is_failed("10.0.0.2:6379"));
        assert_eq!(registry.broadcast("CACHE").len(), 2);
    }

    #[test]
    fn test_failed_set_add_is_idempotent() {
        let mut registry = registry_with_nodes();
        registry.node_failed("10.0.0.1:6379");
        registry.node_failed("10.0.0.1:6379");

        assert_eq!(registry.detect(50.0).len(), 1);
    }

    #[test]
    fn test_auth_and_options_roundtrip() {
        let mut registry = Registry::new();
        registry.set_auth("cluster-a", "default", "hunter2");
        registry.set_channel_option(
            "10.0.0.1:6379",
            ChannelOption {
                with_ssl: true,
                pipeline: true,
                keep_alive: 7.0,
            },
        );

        assert_eq!(registry.auth("cluster-a").unwrap().password, "hunter2");
        assert!(registry.auth("cluster-b").is_none());
        assert!(registry.channel_option("10.0.0.1:6379").unwrap().pipeline);
    }
}

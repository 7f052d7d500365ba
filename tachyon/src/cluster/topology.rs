use crate::net::codec::RespValue;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use photon::logging;
use std::cell::Cell;
use std::rc::Rc;

/// A shard: one master endpoint plus its followers. The follower set is
/// immutable once installed; a topology refresh creates a new node. Many
/// slots share one node, so the rotation cursor lives in a `Cell`.
pub struct RedisNode {
    pub master: String,
    pub followers: IndexSet<String>,
    cursor: Cell<usize>,
}

impl RedisNode {
    pub fn new<S: Into<String>>(master: S) -> RedisNode {
        RedisNode {
            master: master.into(),
            followers: IndexSet::new(),
            cursor: Cell::new(0),
        }
    }

    /// Round-robin follower rotation, skipping endpoints the predicate
    /// rejects. `None` when no usable follower exists.
    pub fn next_follower<F: Fn(&str) -> bool>(&self, usable: F) -> Option<&str> {
        for _ in 0..self.followers.len() {
            let next = (self.cursor.get() + 1) % self.followers.len();
            self.cursor.set(next);
            let candidate = self.followers.get_index(next)?;
            if usable(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// The slot map plus the set of every endpoint named by the last
/// `CLUSTER SLOTS` reply.
pub struct Topology {
    slots: HashMap<u16, Rc<RedisNode>>,
    all_nodes: HashSet<String>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology {
            slots: HashMap::new(),
            all_nodes: HashSet::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn node_for_slot(&self, slot: u16) -> Option<&Rc<RedisNode>> {
        self.slots.get(&slot)
    }

    #[inline]
    pub fn all_nodes(&self) -> &HashSet<String> {
        &self.all_nodes
    }

    #[inline]
    pub fn contains_node(&self, identify: &str) -> bool {
        self.all_nodes.contains(identify)
    }

    /// Any known master, for commands that carry no key.
    pub fn any_master(&self) -> Option<String> {
        self.slots.values().next().map(|node| node.master.clone())
    }

    /// Rebuilds the map from a `CLUSTER SLOTS` reply. Entries are replaced
    /// slot by slot; ranges the reply does not mention keep their previous
    /// node. Malformed entries are skipped, not fatal.
    pub fn apply_cluster_slots(&mut self, reply: &RespValue, log: &logging::Logger) -> bool {
        let ranges = match reply.elements() {
            Some(ranges) => ranges,
            None => {
                logging::error!(log, "unexpected reply type for CLUSTER SLOTS");
                return false;
            }
        };

        self.all_nodes.clear();
        for (index, range) in ranges.iter().enumerate() {
            let elements = match range.elements() {
                Some(elements) if elements.len() >= 3 => elements,
                _ => {
                    logging::error!(log, "invalid slot range entry"; "index" => index);
                    continue;
                }
            };

            let (from, to) = match (elements[0].as_integer(), elements[1].as_integer()) {
                (Some(from), Some(to)) if from >= 0 && to >= from && to < 16384 => (from, to),
                _ => {
                    logging::error!(log, "invalid slot bounds in entry"; "index" => index);
                    continue;
                }
            };

            let mut node = None;
            for (position, endpoint) in elements[2..].iter().enumerate() {
                let identify = match endpoint_identify(endpoint) {
                    Some(identify) => identify,
                    None => {
                        logging::error!(log, "invalid endpoint element";
                                        "index" => index,
                                        "position" => position);
                        break;
                    }
                };

                self.all_nodes.insert(identify.clone());
                match node {
                    None => node = Some(RedisNode::new(identify)),
                    Some(ref mut node) => {
                        node.followers.insert(identify);
                    }
                }
            }

            if let Some(node) = node {
                let node = Rc::new(node);
                for slot in from..=to {
                    self.slots.insert(slot as u16, Rc::clone(&node));
                }
            }
        }

        true
    }
}

impl Default for Topology {
    fn default() -> Topology {
        Topology::new()
    }
}

fn endpoint_identify(endpoint: &RespValue) -> Option<String> {
    let elements = endpoint.elements()?;
    if elements.len() < 2 {
        return None;
    }
    let host = elements[0].text()?;
    let port = elements[1].as_integer()?;
    if host.is_empty() || port <= 0 || port > i64::from(u16::max_value()) {
        return None;
    }
    Some(format!("{}:{}", host, port))
}

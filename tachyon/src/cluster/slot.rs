use crc16::{State, XMODEM};

/// Number of hash buckets a cluster partitions the key space into.
pub const CLUSTER_SLOTS: u16 = 16384;

/// Computes the slot for a key. Only the substring between the first `{`
/// and the following `}` is hashed when such a hash tag exists and is
/// non-empty; otherwise the whole key is hashed.
pub fn slot_of(key: &[u8]) -> u16 {
    let payload = hash_tag(key).unwrap_or(key);
    State::<XMODEM>::calculate(payload) % CLUSTER_SLOTS
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close == 0 {
        // `{}` forces the whole key, matching server behavior.
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

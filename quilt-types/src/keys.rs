//! Store key schema for quilt-sync.
//!
//! All records live under four key families, each keyed by the authoring
//! peer id:
//!
//! - `m_<peer>` - peer meta
//! - `e_<peer>_<shard>` - one shard of the peer's event log
//! - `b_<peer>` - baseline (state snapshot + includes vector)
//! - `s_<peer>` - seen vector
//!
//! Peer ids are opaque and may themselves contain `_`, so the shard
//! index is always the final `_`-separated component of a shard key.

use crate::PeerId;

/// Prefix of meta keys.
pub const META_PREFIX: &str = "m_";
/// Prefix of shard keys.
pub const SHARD_PREFIX: &str = "e_";
/// Prefix of baseline keys.
pub const BASELINE_PREFIX: &str = "b_";
/// Prefix of seen-vector keys.
pub const SEEN_PREFIX: &str = "s_";

/// Scan pattern matching every meta key.
pub const META_SCAN: &str = "^m_";
/// Scan pattern matching every meta and shard key.
pub const META_OR_SHARD_SCAN: &str = "^(m_|e_)";
/// Scan pattern matching every baseline key.
pub const BASELINE_SCAN: &str = "^b_";
/// Scan pattern matching every seen-vector key.
pub const SEEN_SCAN: &str = "^s_";

/// The meta key of a peer.
pub fn meta_key(peer: &PeerId) -> String {
    format!("{META_PREFIX}{peer}")
}

/// The key of one shard of a peer's event log.
pub fn shard_key(peer: &PeerId, shard: u32) -> String {
    format!("{SHARD_PREFIX}{peer}_{shard}")
}

/// The baseline key of a peer.
pub fn baseline_key(peer: &PeerId) -> String {
    format!("{BASELINE_PREFIX}{peer}")
}

/// The seen-vector key of a peer.
pub fn seen_key(peer: &PeerId) -> String {
    format!("{SEEN_PREFIX}{peer}")
}

/// Extract the peer id from a meta key, if it is one.
pub fn peer_from_meta_key(key: &str) -> Option<PeerId> {
    key.strip_prefix(META_PREFIX).map(PeerId::new)
}

/// Extract the peer id from a baseline key, if it is one.
pub fn peer_from_baseline_key(key: &str) -> Option<PeerId> {
    key.strip_prefix(BASELINE_PREFIX).map(PeerId::new)
}

/// Extract the peer id from a seen-vector key, if it is one.
pub fn peer_from_seen_key(key: &str) -> Option<PeerId> {
    key.strip_prefix(SEEN_PREFIX).map(PeerId::new)
}

/// Split a shard key into its peer id and shard index, if it is one.
pub fn parse_shard_key(key: &str) -> Option<(PeerId, u32)> {
    let rest = key.strip_prefix(SHARD_PREFIX)?;
    let (peer, index) = rest.rsplit_once('_')?;
    let index = index.parse().ok()?;
    Some((PeerId::new(peer), index))
}

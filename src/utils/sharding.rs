//! Key -> shard mapping over a fixed-size shard space.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Number of shards the keyspace is partitioned into. Fixed for the
/// lifetime of a cluster; configurations map each of these indices to an
/// owning group.
pub const N_SHARDS: usize = 10;

/// Maps a key to its shard index in `[0, N_SHARDS)`.
///
/// `DefaultHasher::new()` is keyed with fixed constants, so the mapping
/// is identical on every replica of the cluster.
pub fn key_to_shard(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % N_SHARDS as u64) as usize
}

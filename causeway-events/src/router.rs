//! Consistent-hash routing of events to correlator shards.

use causeway_core::{Event, EventKind, SourceId};

/// Hash ring with virtual nodes.
///
/// Each shard owns `virtual_nodes` points on a u64 ring; a key goes to the
/// first point at or after its hash. Adding a shard moves only the keys
/// that land on its new points.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    /// (point, shard) sorted by point
    points: Vec<(u64, usize)>,
    shards: usize,
}

impl ShardRouter {
    pub fn new(shards: usize, virtual_nodes: usize) -> Self {
        let shards = shards.max(1);
        let virtual_nodes = virtual_nodes.max(1);
        let mut points: Vec<(u64, usize)> = (0..shards)
            .flat_map(|shard| {
                (0..virtual_nodes).map(move |vnode| {
                    let mut key = [0u8; 16];
                    key[..8].copy_from_slice(&(shard as u64).to_le_bytes());
                    key[8..].copy_from_slice(&(vnode as u64).to_le_bytes());
                    (mix(fnv1a(&key)), shard)
                })
            })
            .collect();
        points.sort_unstable();
        points.dedup_by_key(|(point, _)| *point);
        Self { points, shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Shard owning `key`.
    #[inline]
    pub fn shard_for(&self, key: SourceId) -> usize {
        if self.shards == 1 {
            return 0;
        }
        let h = mix(fnv1a(&key.0.to_le_bytes()));
        let idx = self.points.partition_point(|(point, _)| *point < h);
        self.points
            .get(idx)
            .or_else(|| self.points.first())
            .map_or(0, |(_, shard)| *shard)
    }

    /// Shard that must see `event`.
    #[inline]
    pub fn route(&self, event: &Event) -> usize {
        self.shard_for(routing_key(event))
    }
}

/// The source whose shard correlates `event`.
///
/// Receives go to the sender's shard so a send and its receive meet in one
/// place, in ring order. Everything else goes to its own source.
#[inline]
pub fn routing_key(event: &Event) -> SourceId {
    match &event.kind {
        EventKind::MessageReceive { from_source_id, .. } => *from_source_id,
        _ => event.source_id,
    }
}

/// FNV-1a over raw bytes.
#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 64-bit finalizer (murmur3 fmix64). FNV alone clusters sequential ids.
#[inline]
fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

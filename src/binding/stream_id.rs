//! Stream id allocation.
//!
//! Initial ids are odd and reply ids are the initial id with the low bit
//! cleared, so both directions of a stream are derived from one value.
//!
//! Layout, high to low: owning shard (bits 56..63), allocating shard
//! (48..56), binding slot (32..48), per-binding sequence (0..32). The owning
//! shard keeps both directions of a stream on one shard; the other fields keep
//! ids unique across bindings and shards.

use std::collections::HashMap;

const OWNER_SHIFT: u32 = 56;
const ALLOCATOR_SHIFT: u32 = 48;
const SLOT_SHIFT: u32 = 32;
const SHARD_MASK: u64 = 0x7f;
const SEQUENCE_MASK: u64 = 0xffff_ffff;

/// Whether `stream_id` names the initial direction.
#[must_use]
pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 1 == 1
}

/// Reply id for a stream id in either direction.
#[must_use]
pub fn reply_id(stream_id: u64) -> u64 {
    stream_id & !1
}

/// Initial id for a stream id in either direction.
#[must_use]
pub fn initial_id(stream_id: u64) -> u64 {
    stream_id | 1
}

/// The id of the opposite direction.
#[must_use]
pub fn opposite_id(stream_id: u64) -> u64 {
    stream_id ^ 1
}

/// Shard owning `stream_id` among `shards`.
#[must_use]
pub fn shard_of(stream_id: u64, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    ((stream_id >> OWNER_SHIFT) & SHARD_MASK) as usize % shards
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    slot: u64,
    next: u64,
}

/// Allocates initial ids per binding on one shard, increasing by 2.
#[derive(Debug)]
pub struct StreamIdSupplier {
    shard: usize,
    shards: usize,
    counters: HashMap<u64, Counter>,
    trace: u64,
}

impl StreamIdSupplier {
    /// Supplier for shard `shard` of `shards`.
    #[must_use]
    pub fn new(shard: usize, shards: usize) -> Self {
        Self {
            shard,
            shards: shards.max(1),
            counters: HashMap::new(),
            trace: 0,
        }
    }

    /// Shard this supplier allocates on.
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Number of shards ids are spread over.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Next initial id for `binding_id` owned by this shard.
    pub fn supply_initial_id(&mut self, binding_id: u64) -> u64 {
        self.supply_on(binding_id, self.shard)
    }

    /// Next initial id for `binding_id` owned by the shard selected by
    /// `affinity`, or by this shard when `affinity` is 0.
    pub fn supply_initial_id_with_affinity(&mut self, binding_id: u64, affinity: u64) -> u64 {
        let shard = if affinity == 0 {
            self.shard
        } else {
            (affinity % self.shards as u64) as usize
        };
        self.supply_on(binding_id, shard)
    }

    fn supply_on(&mut self, binding_id: u64, owner: usize) -> u64 {
        let slots = self.counters.len() as u64;
        let counter = self.counters.entry(binding_id).or_insert(Counter {
            slot: slots & 0xffff,
            next: 1,
        });
        let sequence = counter.next;
        counter.next = (sequence + 2) & SEQUENCE_MASK | 1;

        ((owner as u64 & SHARD_MASK) << OWNER_SHIFT)
            | ((self.shard as u64 & 0xff) << ALLOCATOR_SHIFT)
            | (counter.slot << SLOT_SHIFT)
            | sequence
    }

    /// Next trace id, unique on this shard.
    pub fn supply_trace_id(&mut self) -> u64 {
        self.trace = self.trace.wrapping_add(1) & ((1 << OWNER_SHIFT) - 1);
        ((self.shard as u64 & SHARD_MASK) << OWNER_SHIFT) | self.trace
    }
}

//! Handler arena and stream routing tables owned by one shard.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::binding::{opposite_id, StreamHandler};

/// Generational index of a handler in the arena. Keys of released handlers
/// never resolve again, even after their slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    index: u32,
    generation: u32,
}

/// Who receives frames addressed to a stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumer {
    /// A handler on this shard.
    Handler(HandlerKey),
    /// The embedding process, reached through the egress queue.
    External,
    /// Another shard, reached through its lane.
    Remote(usize),
}

struct Slot {
    generation: u32,
    handler: Option<Box<dyn StreamHandler>>,
    reserved: bool,
    /// Initial ids whose table entries go away with this handler.
    owned: Vec<u64>,
}

/// Index-based storage for stream handlers with slot reuse.
#[derive(Default)]
pub struct HandlerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl HandlerArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot before the handler exists, so frames it writes while
    /// being created can name it as their source.
    pub fn reserve(&mut self) -> HandlerKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.reserved = true;
            return HandlerKey {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            handler: None,
            reserved: true,
            owned: Vec::new(),
        });
        HandlerKey {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn slot_mut(&mut self, key: HandlerKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation && slot.reserved)
    }

    /// Place a handler in a reserved slot.
    pub fn fill(&mut self, key: HandlerKey, handler: Box<dyn StreamHandler>) {
        if let Some(slot) = self.slot_mut(key) {
            slot.handler = Some(handler);
        }
    }

    /// Record that `initial_id`'s table entries belong to this handler.
    pub fn own(&mut self, key: HandlerKey, initial_id: u64) {
        if let Some(slot) = self.slot_mut(key) {
            slot.owned.push(initial_id);
        }
    }

    /// Borrow a live handler.
    pub fn get_mut(&mut self, key: HandlerKey) -> Option<&mut (dyn StreamHandler + 'static)> {
        self.slot_mut(key)?.handler.as_deref_mut()
    }

    /// Whether the key resolves to a live handler.
    #[must_use]
    pub fn contains(&self, key: HandlerKey) -> bool {
        self.slots
            .get(key.index as usize)
            .is_some_and(|slot| slot.generation == key.generation && slot.reserved)
    }

    /// Whether `key` is a handler reporting closed or a reservation never
    /// filled. Released keys are not closed, they are gone.
    #[must_use]
    pub fn is_closed(&self, key: HandlerKey) -> bool {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation && slot.reserved)
            .is_some_and(|slot| slot.handler.as_ref().map_or(true, |h| h.is_closed()))
    }

    /// Release a slot, returning the initial ids it owned.
    pub fn release(&mut self, key: HandlerKey) -> Vec<u64> {
        let Some(slot) = self.slot_mut(key) else {
            return Vec::new();
        };
        slot.handler = None;
        slot.reserved = false;
        slot.generation = slot.generation.wrapping_add(1);
        let owned = std::mem::take(&mut slot.owned);
        self.free.push(key.index);
        self.live -= 1;
        owned
    }

    /// Number of live handlers and reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no handler is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// Most recently retired stream ids remembered per shard.
const RETIRED_CAPACITY: usize = 4096;

/// Receivers of stream frames (`streams`) and throttle frames (`throttles`)
/// by stream id, plus the ids of streams that already closed.
#[derive(Debug, Default)]
pub struct StreamTables {
    streams: HashMap<u64, Consumer>,
    throttles: HashMap<u64, Consumer>,
    retired: HashSet<u64>,
    retired_order: VecDeque<u64>,
}

impl StreamTables {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver of stream frames on `stream_id`.
    #[must_use]
    pub fn stream(&self, stream_id: u64) -> Option<Consumer> {
        self.streams.get(&stream_id).copied()
    }

    /// Receiver of throttle frames on `stream_id`.
    #[must_use]
    pub fn throttle(&self, stream_id: u64) -> Option<Consumer> {
        self.throttles.get(&stream_id).copied()
    }

    /// Register a new stream `stream_id` written by `source` and read by
    /// `target`. The reply direction is wired the opposite way.
    pub fn register(&mut self, stream_id: u64, source: Consumer, target: Consumer) {
        let opposite = opposite_id(stream_id);
        self.retired.remove(&stream_id);
        self.retired.remove(&opposite);
        self.streams.insert(stream_id, target);
        self.throttles.insert(opposite, target);
        self.streams.insert(opposite, source);
        self.throttles.insert(stream_id, source);
    }

    /// Remove both directions of a stream.
    pub fn remove(&mut self, stream_id: u64) {
        let opposite = opposite_id(stream_id);
        for id in [stream_id, opposite] {
            self.streams.remove(&id);
            self.throttles.remove(&id);
        }
    }

    /// Remove both directions of a closed stream and remember its ids, so late
    /// frames on them can be told apart from frames before Begin. Only the
    /// last few thousand ids are kept; registering an id again forgets it.
    pub fn retire(&mut self, stream_id: u64) {
        self.remove(stream_id);
        for id in [stream_id, opposite_id(stream_id)] {
            if self.retired.insert(id) {
                self.retired_order.push_back(id);
            }
        }
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    /// Whether `stream_id` belongs to a stream that closed on this shard.
    #[must_use]
    pub fn is_retired(&self, stream_id: u64) -> bool {
        self.retired.contains(&stream_id)
    }

    /// Number of registered stream ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::NoopStream;

    #[test]
    fn test_stale_key_does_not_resolve() {
        let mut arena = HandlerArena::new();
        let key = arena.reserve();
        arena.fill(key, Box::new(NoopStream));
        assert!(arena.contains(key));

        arena.release(key);
        let reused = arena.reserve();
        assert!(!arena.contains(key));
        assert!(arena.contains(reused));
        assert!(arena.get_mut(key).is_none());
    }

    #[test]
    fn test_closed_and_unfilled_reported() {
        let mut arena = HandlerArena::new();
        let closed = arena.reserve();
        arena.fill(closed, Box::new(NoopStream));
        let unfilled = arena.reserve();

        assert!(arena.is_closed(closed));
        assert!(arena.is_closed(unfilled));
        assert_eq!(arena.len(), 2);

        arena.release(closed);
        assert!(!arena.is_closed(closed));
    }

    #[test]
    fn test_release_returns_owned_ids() {
        let mut arena = HandlerArena::new();
        let key = arena.reserve();
        arena.own(key, 5);
        arena.own(key, 9);
        assert_eq!(arena.release(key), vec![5, 9]);
        assert!(arena.is_empty());
        assert!(arena.release(key).is_empty());
    }

    #[test]
    fn test_register_wires_both_directions() {
        let mut tables = StreamTables::new();
        let mut arena = HandlerArena::new();
        let handler = Consumer::Handler(arena.reserve());

        tables.register(7, Consumer::External, handler);

        assert_eq!(tables.stream(7), Some(handler));
        assert_eq!(tables.throttle(6), Some(handler));
        assert_eq!(tables.stream(6), Some(Consumer::External));
        assert_eq!(tables.throttle(7), Some(Consumer::External));

        tables.remove(7);
        assert!(tables.is_empty());
        assert!(tables.throttle(6).is_none());
        assert!(!tables.is_retired(7));
    }

    #[test]
    fn test_retired_ids_are_remembered_until_reused() {
        let mut tables = StreamTables::new();
        tables.register(7, Consumer::External, Consumer::Remote(1));
        tables.retire(7);

        assert!(tables.is_empty());
        assert!(tables.is_retired(7));
        assert!(tables.is_retired(6));

        tables.register(7, Consumer::External, Consumer::Remote(1));
        assert!(!tables.is_retired(7));
        assert!(!tables.is_retired(6));
    }

    #[test]
    fn test_retired_ids_are_bounded() {
        let mut tables = StreamTables::new();
        for n in 0..(RETIRED_CAPACITY as u64) {
            tables.retire(2 * n + 1);
        }
        assert!(!tables.is_retired(1));
        assert!(tables.is_retired(2 * (RETIRED_CAPACITY as u64) - 1));
    }
}

//! The shard surface a stream handler writes through.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::metrics::{EventKind, EventSink};
use super::table::{Consumer, HandlerKey};
use super::timer::TimerQueue;
use crate::binding::StreamIdSupplier;
use crate::budget::BudgetPool;
use crate::frame::{Frame, FrameResult};

/// An encoded frame waiting in the shard outbox.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) source: Consumer,
    /// Deliver here instead of looking the stream id up in the tables.
    pub(crate) target: Option<Consumer>,
    pub(crate) type_id: u32,
    pub(crate) frame: Bytes,
}

/// Mutable shard state handlers reach through [`StreamContext`].
pub(crate) struct ShardState {
    pub(crate) outbox: VecDeque<Envelope>,
    pub(crate) timers: TimerQueue,
    pub(crate) ids: StreamIdSupplier,
    pub(crate) watchers: HashMap<u64, Vec<HandlerKey>>,
    /// Budgets each handler watches, so a released handler can be dropped
    /// from `watchers`.
    pub(crate) watching: HashMap<HandlerKey, Vec<u64>>,
}

impl ShardState {
    pub(crate) fn new(shard: usize, shards: usize) -> Self {
        Self {
            outbox: VecDeque::new(),
            timers: TimerQueue::new(),
            ids: StreamIdSupplier::new(shard, shards),
            watchers: HashMap::new(),
            watching: HashMap::new(),
        }
    }

    pub(crate) fn watch(&mut self, key: HandlerKey, budget_id: u64) {
        let watchers = self.watchers.entry(budget_id).or_default();
        if !watchers.contains(&key) {
            watchers.push(key);
            self.watching.entry(key).or_default().push(budget_id);
        }
    }

    /// Remove and return the watchers of `budget_id`.
    pub(crate) fn take_watchers(&mut self, budget_id: u64) -> Vec<HandlerKey> {
        let watchers = self.watchers.remove(&budget_id).unwrap_or_default();
        for key in &watchers {
            if let Some(budgets) = self.watching.get_mut(key) {
                budgets.retain(|id| *id != budget_id);
                if budgets.is_empty() {
                    self.watching.remove(key);
                }
            }
        }
        watchers
    }

    /// Forget every watch held by a released handler.
    pub(crate) fn unwatch(&mut self, key: HandlerKey) {
        for budget_id in self.watching.remove(&key).unwrap_or_default() {
            if let Some(watchers) = self.watchers.get_mut(&budget_id) {
                watchers.retain(|watcher| *watcher != key);
                if watchers.is_empty() {
                    self.watchers.remove(&budget_id);
                }
            }
        }
    }

    pub(crate) fn enqueue(&mut self, source: Consumer, target: Option<Consumer>, frame: &Frame<'_>) -> FrameResult<()> {
        let mut buffer = BytesMut::with_capacity(frame.sizeof());
        frame.encode_to(&mut buffer)?;
        self.outbox.push_back(Envelope {
            source,
            target,
            type_id: frame.type_id(),
            frame: buffer.freeze(),
        });
        Ok(())
    }
}

/// Everything a binding or stream handler may do to its shard: write frames,
/// allocate ids, schedule timers, use budgets and record events.
///
/// Frames written here are queued and delivered in order after the current
/// callback returns; handlers are never re-entered from inside a write.
pub struct StreamContext<'w> {
    state: &'w mut ShardState,
    pool: &'w BudgetPool,
    sink: &'w dyn EventSink,
    current: Consumer,
    now: Instant,
}

impl<'w> StreamContext<'w> {
    pub(crate) fn new(
        state: &'w mut ShardState,
        pool: &'w BudgetPool,
        sink: &'w dyn EventSink,
        current: Consumer,
        now: Instant,
    ) -> Self {
        Self {
            state,
            pool,
            sink,
            current,
            now,
        }
    }

    /// Queue a frame for delivery to whoever receives its stream id.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable-length field is too large to encode.
    pub fn write(&mut self, frame: &Frame<'_>) -> FrameResult<()> {
        self.state.enqueue(self.current, None, frame)
    }

    /// Next initial stream id for `binding_id` on this shard.
    pub fn supply_initial_id(&mut self, binding_id: u64) -> u64 {
        self.state.ids.supply_initial_id(binding_id)
    }

    /// Next initial stream id for `binding_id` on the shard chosen by
    /// `affinity` (0 keeps it on this shard).
    pub fn supply_initial_id_with_affinity(&mut self, binding_id: u64, affinity: u64) -> u64 {
        self.state
            .ids
            .supply_initial_id_with_affinity(binding_id, affinity)
    }

    /// Reply id of `initial_id`.
    #[must_use]
    pub fn supply_reply_id(&self, initial_id: u64) -> u64 {
        crate::binding::reply_id(initial_id)
    }

    /// Next trace id.
    pub fn supply_trace_id(&mut self) -> u64 {
        self.state.ids.supply_trace_id()
    }

    /// Schedule a Signal frame with `signal_id` on `stream_id` at `deadline`.
    /// Returns the cancellation token.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        origin_id: u64,
        routed_id: u64,
        stream_id: u64,
        signal_id: u32,
    ) -> u64 {
        self.state
            .timers
            .schedule(deadline, origin_id, routed_id, stream_id, signal_id)
    }

    /// Cancel a timer. Best-effort: a timer already due may still fire.
    pub fn cancel(&mut self, cancel_id: u64) -> bool {
        self.state.timers.cancel(cancel_id)
    }

    /// Claim up to `amount` from a shared budget.
    pub fn claim(&self, budget_id: u64, amount: u64) -> u64 {
        self.pool.claim(budget_id, amount)
    }

    /// Claim `maximum`, or what remains if at least `minimum`.
    pub fn claim_range(&self, budget_id: u64, minimum: u64, maximum: u64) -> u64 {
        self.pool.claim_range(budget_id, minimum, maximum)
    }

    /// Return credit to a shared budget.
    pub fn credit(&self, budget_id: u64, amount: u64) -> u64 {
        self.pool.credit(budget_id, amount)
    }

    /// Ask to be woken with [`crate::binding::StreamHandler::on_budget_credit`]
    /// on the next credit to `budget_id`. Fires once.
    pub fn watch_budget(&mut self, budget_id: u64) {
        if let Consumer::Handler(key) = self.current {
            self.state.watch(key, budget_id);
        }
    }

    /// Record an event.
    pub fn record(&self, kind: EventKind, binding_id: u64, value: u64) {
        self.sink.record(kind, binding_id, value);
    }

    /// Time the current dispatch started.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Index of this shard.
    #[must_use]
    pub fn shard(&self) -> usize {
        self.state.ids.shard()
    }
}

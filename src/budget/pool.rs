//! Shared, non-blocking credit pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::trace;

/// Budget id meaning "no shared budget"; claims against it are always granted
/// in full.
pub const NO_BUDGET: u64 = 0;

const CREDIT_EVENTS: usize = 256;

#[derive(Debug, Default)]
struct BudgetEntry {
    credit: AtomicU64,
    closed: AtomicBool,
}

impl BudgetEntry {
    /// Take up to `maximum` credit, or nothing if less than `minimum` remains.
    fn take(&self, minimum: u64, maximum: u64) -> u64 {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return 0;
            }

            let current = self.credit.load(Ordering::Acquire);
            let granted = current.min(maximum);
            if granted == 0 || granted < minimum {
                return 0;
            }

            match self.credit.compare_exchange_weak(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(_) => continue,
            }
        }
    }

    fn add(&self, amount: u64) -> u64 {
        let mut current = self.credit.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(amount);
            match self.credit.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Credit shared by every stream that rides the same physical transport.
///
/// Entries are created by [`BudgetPool::open`] or implicitly by the first
/// [`BudgetPool::credit`]. Balances never go negative: a claim is granted at
/// most what remains. Credit events are broadcast so shards can wake the
/// streams waiting on a budget.
#[derive(Debug)]
pub struct BudgetPool {
    entries: RwLock<HashMap<u64, Arc<BudgetEntry>>>,
    events: broadcast::Sender<u64>,
}

impl Default for BudgetPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CREDIT_EVENTS);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn entry(&self, budget_id: u64) -> Option<Arc<BudgetEntry>> {
        let entries = self.entries.read().ok()?;
        entries.get(&budget_id).cloned()
    }

    fn entry_or_insert(&self, budget_id: u64) -> Option<Arc<BudgetEntry>> {
        if let Some(entry) = self.entry(budget_id) {
            return Some(entry);
        }
        let mut entries = self.entries.write().ok()?;
        Some(Arc::clone(entries.entry(budget_id).or_default()))
    }

    /// Open a budget with zero credit. Reopening a closed budget clears it.
    pub fn open(&self, budget_id: u64) {
        if let Some(entry) = self.entry_or_insert(budget_id) {
            entry.closed.store(false, Ordering::Release);
            trace!(budget_id, "Budget opened");
        }
    }

    /// Close a budget. Later claims are granted nothing and the entry is
    /// removed.
    pub fn close(&self, budget_id: u64) {
        let removed = match self.entries.write() {
            Ok(mut entries) => entries.remove(&budget_id),
            Err(_) => None,
        };
        if let Some(entry) = removed {
            entry.closed.store(true, Ordering::Release);
            trace!(budget_id, "Budget closed");
        }
    }

    /// Add credit to a budget and return the new balance.
    pub fn credit(&self, budget_id: u64, amount: u64) -> u64 {
        let Some(entry) = self.entry_or_insert(budget_id) else {
            return 0;
        };
        let balance = entry.add(amount);
        trace!(budget_id, amount, balance, "Budget credited");

        if amount > 0 {
            // No subscribers simply means no shard is waiting.
            let _ = self.events.send(budget_id);
        }
        balance
    }

    /// Claim up to `amount`. Returns the granted credit, `0 <= granted <= amount`.
    /// Unknown and closed budgets grant 0.
    pub fn claim(&self, budget_id: u64, amount: u64) -> u64 {
        self.claim_range(budget_id, 1, amount)
    }

    /// Claim `maximum`, or whatever remains if that is at least `minimum`;
    /// otherwise nothing.
    pub fn claim_range(&self, budget_id: u64, minimum: u64, maximum: u64) -> u64 {
        if budget_id == NO_BUDGET {
            return maximum;
        }
        self.entry(budget_id)
            .map_or(0, |entry| entry.take(minimum, maximum))
    }

    /// Current balance, or 0 for an unknown budget.
    #[must_use]
    pub fn remaining(&self, budget_id: u64) -> u64 {
        self.entry(budget_id)
            .map_or(0, |entry| entry.credit.load(Ordering::Acquire))
    }

    /// Whether the budget is known and open.
    #[must_use]
    pub fn is_open(&self, budget_id: u64) -> bool {
        self.entry(budget_id)
            .is_some_and(|entry| !entry.closed.load(Ordering::Acquire))
    }

    /// Subscribe to credit events. Each event carries the credited budget id.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.events.subscribe()
    }
}

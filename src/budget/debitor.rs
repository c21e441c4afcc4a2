//! Budget debitor: claims credit from budgets owned by another partition.
//!
//! A debitor belongs to one worker (its watcher index) and one owner
//! partition. Consumers register per budget under a watcher id; when a claim
//! comes up short the consumer becomes a watcher, and the debitor sets its
//! single bit in the slot's shared watcher mask so the creditor knows whom to
//! flush. The bit is cleared once no local watcher remains for the budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::layout::BudgetsLayout;
use super::{owner_index, probe_start, BudgetIndex, MAX_WATCHERS};

/// Callback invoked with a trace id when a watched budget was credited.
pub type Flusher = Box<dyn FnMut(u64) + Send>;

/// Debitor for the budgets of one owner partition, on behalf of one worker.
pub struct BudgetDebitor {
    watcher_index: usize,
    owner_index: usize,
    watcher_mask: u64,
    layout: Arc<BudgetsLayout>,
    budget_id_by_index: HashMap<BudgetIndex, u64>,
    flushers_by_budget_id: HashMap<u64, HashMap<u64, Flusher>>,
    watcher_ids_by_budget_id: HashMap<u64, HashSet<u64>>,
}

impl BudgetDebitor {
    /// Create a debitor watching as `watcher_index` on `owner_index`'s table.
    ///
    /// # Panics
    ///
    /// Panics if `watcher_index` does not fit the 64-bit watcher mask.
    pub fn new(watcher_index: usize, owner_index: usize, layout: Arc<BudgetsLayout>) -> Self {
        assert!(
            watcher_index < MAX_WATCHERS,
            "watcher index {watcher_index} exceeds {MAX_WATCHERS} watchers"
        );
        assert!(layout.capacity().is_power_of_two());
        Self {
            watcher_index,
            owner_index,
            watcher_mask: 1 << watcher_index,
            layout,
            budget_id_by_index: HashMap::new(),
            flushers_by_budget_id: HashMap::new(),
            watcher_ids_by_budget_id: HashMap::new(),
        }
    }

    pub fn watcher_index(&self) -> usize {
        self.watcher_index
    }

    pub fn owner_index(&self) -> usize {
        self.owner_index
    }

    /// Find the live slot for `budget_id` and register `flusher` for
    /// `watcher_id` on it.
    ///
    /// Returns `None` if the budget is not (yet) live.
    pub fn acquire(
        &mut self,
        budget_id: u64,
        watcher_id: u64,
        flusher: impl FnMut(u64) + Send + 'static,
    ) -> Option<BudgetIndex> {
        assert_eq!(
            owner_index(budget_id),
            self.owner_index,
            "budget {budget_id:#018x} not owned by partition {}",
            self.owner_index
        );

        let entries = self.layout.capacity();
        let entries_mask = entries - 1;
        let mut slot = probe_start(budget_id, entries_mask);
        for _ in 0..entries {
            if self.layout.slot(slot).budget_id() == budget_id {
                let index = BudgetIndex::new(self.owner_index, slot);
                self.flushers_by_budget_id
                    .entry(budget_id)
                    .or_default()
                    .insert(watcher_id, Box::new(flusher));
                self.budget_id_by_index.insert(index, budget_id);

                tracing::trace!(watcher_id, budget_id, ?index, "debitor acquired");
                return Some(index);
            }

            slot = (slot + 1) & entries_mask;
        }

        None
    }

    /// Claim between `minimum` and `maximum` credit, with nothing deferred.
    pub fn claim(
        &mut self,
        trace_id: u64,
        index: BudgetIndex,
        watcher_id: u64,
        minimum: u32,
        maximum: u32,
    ) -> u32 {
        self.claim_deferred(trace_id, index, watcher_id, minimum, maximum, 0)
    }

    /// Claim up to `maximum` credit from the budget.
    ///
    /// The result is `maximum` when the budget covers it, all that remains
    /// when that is at least `minimum`, and 0 otherwise. A short claim leaves
    /// `watcher_id` watching the budget; a full claim stops it watching.
    /// `deferred` is only reported in trace events.
    ///
    /// # Panics
    ///
    /// Panics if `minimum > maximum` or `index` belongs to another partition.
    pub fn claim_deferred(
        &mut self,
        trace_id: u64,
        index: BudgetIndex,
        watcher_id: u64,
        minimum: u32,
        maximum: u32,
        deferred: u32,
    ) -> u32 {
        assert!(
            minimum <= maximum,
            "claim minimum {minimum} exceeds maximum {maximum}"
        );

        let slot = index.slot(self.owner_index);
        let entry = self.layout.slot(slot);
        let budget_id = self
            .budget_id_by_index
            .get(&index)
            .copied()
            .unwrap_or_else(|| entry.budget_id());

        let requested = i64::from(maximum);
        let previous = entry.get_and_add_remaining(-requested);
        let claimed = if previous - requested < 0 {
            if previous >= i64::from(minimum) {
                entry.get_and_add_remaining(requested - previous);
                previous
            } else {
                entry.get_and_add_remaining(requested);
                0
            }
        } else {
            requested
        };

        tracing::trace!(
            trace_id,
            watcher_id,
            budget_id,
            claimed,
            maximum,
            deferred,
            previous,
            remaining = previous - claimed,
            "claimed"
        );

        if claimed != requested {
            self.watch(slot, budget_id, watcher_id);
        } else {
            self.unwatch(slot, budget_id, watcher_id);
        }

        // 0 <= claimed <= maximum, so the narrowing is lossless.
        claimed as u32
    }

    /// Drop the registration of `watcher_id` on the budget.
    ///
    /// # Panics
    ///
    /// Panics if `watcher_id` was never acquired on `index`.
    pub fn release(&mut self, index: BudgetIndex, watcher_id: u64) {
        let budget_id = self.budget_id_by_index.get(&index).copied();
        if let Some(budget_id) = budget_id {
            self.unwatch(index.slot(self.owner_index), budget_id, watcher_id);
        }

        let flushers = budget_id.and_then(|id| self.flushers_by_budget_id.get_mut(&id));
        let removed = flushers.and_then(|flushers| flushers.remove(&watcher_id));
        assert!(
            removed.is_some(),
            "watcher {watcher_id:#x} released {index:?} without acquiring it"
        );

        if let Some(budget_id) = budget_id {
            let unused = self
                .flushers_by_budget_id
                .get(&budget_id)
                .is_some_and(HashMap::is_empty);
            if unused {
                self.flushers_by_budget_id.remove(&budget_id);
                self.budget_id_by_index.remove(&index);
            }

            tracing::trace!(watcher_id, budget_id, ?index, "debitor released");
        }
    }

    /// Invoke the flusher of every watcher waiting on `budget_id`.
    pub fn flush(&mut self, trace_id: u64, budget_id: u64) {
        assert_eq!(
            owner_index(budget_id),
            self.owner_index,
            "budget {budget_id:#018x} not owned by partition {}",
            self.owner_index
        );

        let watcher_ids = self.watcher_ids_by_budget_id.get(&budget_id);
        let flushers = self.flushers_by_budget_id.get_mut(&budget_id);

        tracing::trace!(
            trace_id,
            budget_id,
            watchers = watcher_ids.map_or(0, HashSet::len),
            flushers = flushers.as_ref().map_or(0, |flushers| flushers.len()),
            "flush"
        );

        if let (Some(watcher_ids), Some(flushers)) = (watcher_ids, flushers) {
            for watcher_id in watcher_ids {
                if let Some(flush) = flushers.get_mut(watcher_id) {
                    flush(trace_id);
                }
            }
        }
    }

    /// Remaining credit of the budget. Stale the moment it is read.
    pub fn available(&self, index: BudgetIndex) -> i64 {
        self.layout.slot(index.slot(self.owner_index)).remaining()
    }

    /// Shared watcher mask of the budget.
    pub fn watchers(&self, index: BudgetIndex) -> u64 {
        self.layout.slot(index.slot(self.owner_index)).watchers()
    }

    /// Budget id currently occupying the slot behind `index`.
    pub fn budget_id(&self, index: BudgetIndex) -> u64 {
        self.layout.slot(index.slot(self.owner_index)).budget_id()
    }

    /// Whether `watcher_id` is waiting for credit on `budget_id`.
    pub fn is_watching(&self, budget_id: u64, watcher_id: u64) -> bool {
        self.watcher_ids_by_budget_id
            .get(&budget_id)
            .is_some_and(|watcher_ids| watcher_ids.contains(&watcher_id))
    }

    /// Number of budgets with at least one registration.
    pub fn acquired(&self) -> usize {
        self.budget_id_by_index.len()
    }

    fn watch(&mut self, slot: usize, budget_id: u64, watcher_id: u64) {
        self.watcher_ids_by_budget_id
            .entry(budget_id)
            .or_default()
            .insert(watcher_id);

        let entry = self.layout.slot(slot);
        let mut watchers = entry.watchers();
        while watchers & self.watcher_mask == 0 {
            match entry.compare_exchange_watchers(watchers, watchers | self.watcher_mask) {
                Ok(_) => break,
                Err(actual) => {
                    watchers = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// The shared bit is only cleared while `budget_id` still holds the
    /// slot. A released slot had its mask zeroed by the creditor, and a
    /// reacquired one belongs to another budget.
    fn unwatch(&mut self, slot: usize, budget_id: u64, watcher_id: u64) {
        let Some(watcher_ids) = self.watcher_ids_by_budget_id.get_mut(&budget_id) else {
            return;
        };

        watcher_ids.remove(&watcher_id);
        if !watcher_ids.is_empty() {
            return;
        }
        self.watcher_ids_by_budget_id.remove(&budget_id);

        let entry = self.layout.slot(slot);
        if entry.budget_id() != budget_id {
            return;
        }
        let mut watchers = entry.watchers();
        while watchers & self.watcher_mask != 0 {
            match entry.compare_exchange_watchers(watchers, watchers & !self.watcher_mask) {
                Ok(_) => break,
                Err(actual) => {
                    watchers = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

//! Budget creditor: slot allocation and credit injection for one partition.
//!
//! Only the thread owning a partition allocates or releases its slots, so the
//! `budget_id` field of a slot has a single writer. `remaining` and `watchers`
//! are shared with debitors on other threads and only change atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::child::ChildBudgets;
use super::layout::BudgetsLayout;
use super::{owner_index, probe_start, BudgetIndex, NO_BUDGET_ID};

/// Wakes the debitors watching a budget after it was credited.
pub trait FlushDispatcher: Send {
    /// `watchers` has one bit set per watching debitor.
    fn flush(&self, trace_id: u64, budget_id: u64, watchers: u64);
}

impl<F> FlushDispatcher for F
where
    F: Fn(u64, u64, u64) + Send,
{
    fn flush(&self, trace_id: u64, budget_id: u64, watchers: u64) {
        self(trace_id, budget_id, watchers)
    }
}

/// Budget id generator supplied by the hosting worker.
pub type BudgetIdGenerator = Box<dyn FnMut() -> u64 + Send>;

/// Creditor for the budgets of one owner partition.
pub struct BudgetCreditor {
    owner_index: usize,
    layout: Arc<BudgetsLayout>,
    flusher: Box<dyn FlushDispatcher>,
    supply_budget_id: BudgetIdGenerator,
    budget_index_by_id: HashMap<u64, BudgetIndex>,
    children: ChildBudgets,
}

impl BudgetCreditor {
    /// Create the creditor for `owner_index` over its partition's layout.
    ///
    /// # Arguments
    ///
    /// * `owner_index` - Partition owned by the calling worker
    /// * `layout` - The partition's budget table
    /// * `flusher` - Invoked when credit lands on a watched budget
    /// * `supply_budget_id` - Generator for child (and top-level) budget ids
    /// * `child_cleanup_linger` - Delay before a cleaned-up child is forgotten
    pub fn new(
        owner_index: usize,
        layout: Arc<BudgetsLayout>,
        flusher: impl FlushDispatcher + 'static,
        supply_budget_id: impl FnMut() -> u64 + Send + 'static,
        child_cleanup_linger: Duration,
    ) -> Self {
        assert!(layout.capacity().is_power_of_two());
        Self {
            owner_index,
            layout,
            flusher: Box::new(flusher),
            supply_budget_id: Box::new(supply_budget_id),
            budget_index_by_id: HashMap::new(),
            children: ChildBudgets::new(child_cleanup_linger),
        }
    }

    /// Owner partition of this creditor.
    pub fn owner_index(&self) -> usize {
        self.owner_index
    }

    /// Place `budget_id` in a free slot with zero credit and no watchers.
    ///
    /// Returns `None` when every slot is taken; the caller decides whether to
    /// reject the flow. Acquiring a budget that is already live returns its
    /// existing index.
    pub fn acquire(&mut self, budget_id: u64) -> Option<BudgetIndex> {
        assert_ne!(budget_id, NO_BUDGET_ID, "budget id 0 is reserved");
        assert_eq!(
            owner_index(budget_id),
            self.owner_index,
            "budget {budget_id:#018x} not owned by partition {}",
            self.owner_index
        );

        if let Some(&index) = self.budget_index_by_id.get(&budget_id) {
            tracing::debug!(budget_id, ?index, "budget already acquired");
            return Some(index);
        }

        let entries = self.layout.capacity();
        let entries_mask = entries - 1;
        let mut slot = probe_start(budget_id, entries_mask);
        for _ in 0..entries {
            let entry = self.layout.slot(slot);
            if entry.compare_exchange_budget_id(NO_BUDGET_ID, budget_id).is_ok() {
                entry.set_remaining(0);
                entry.set_watchers(0);

                let index = BudgetIndex::new(self.owner_index, slot);
                self.budget_index_by_id.insert(budget_id, index);

                tracing::trace!(budget_id, ?index, "creditor acquired");
                return Some(index);
            }

            slot = (slot + 1) & entries_mask;
        }

        tracing::warn!(
            budget_id,
            capacity = entries,
            owner_index = self.owner_index,
            "Budget table exhausted"
        );
        None
    }

    /// Add `credit` to the budget, returning the balance before the credit.
    ///
    /// Watching debitors are flushed so they can retry their claims.
    pub fn credit(&self, trace_id: u64, index: BudgetIndex, credit: i64) -> i64 {
        let entry = self.layout.slot(index.slot(self.owner_index));
        let previous = entry.get_and_add_remaining(credit);
        let watchers = entry.watchers();
        let budget_id = entry.budget_id();

        tracing::trace!(
            trace_id,
            budget_id,
            credit,
            previous,
            remaining = previous + credit,
            watchers,
            "credited"
        );

        if watchers != 0 {
            self.flusher.flush(trace_id, budget_id, watchers);
        }

        previous
    }

    /// Credit a budget by id. Unknown ids are ignored, since credit may race
    /// ahead of acquisition or behind release.
    pub fn credit_by_id(&self, trace_id: u64, budget_id: u64, credit: i64) {
        match self.budget_index_by_id.get(&budget_id) {
            Some(&index) => {
                self.credit(trace_id, index, credit);
            }
            None => tracing::trace!(trace_id, budget_id, credit, "credit for unknown budget"),
        }
    }

    /// Free the slot behind `index`, clearing id, credit and watchers.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not acquired.
    pub fn release(&mut self, index: BudgetIndex) {
        let entry = self.layout.slot(index.slot(self.owner_index));
        let budget_id = entry.swap_budget_id(NO_BUDGET_ID);
        assert_ne!(budget_id, NO_BUDGET_ID, "released {index:?} was never acquired");

        entry.set_remaining(0);
        entry.set_watchers(0);
        self.budget_index_by_id.remove(&budget_id);

        tracing::trace!(budget_id, ?index, "creditor released");
    }

    /// Index of a live budget acquired by this creditor.
    pub fn budget_index(&self, budget_id: u64) -> Option<BudgetIndex> {
        self.budget_index_by_id.get(&budget_id).copied()
    }

    /// Fresh budget id from the hosting worker's generator.
    pub fn supply_budget_id(&mut self) -> u64 {
        (self.supply_budget_id)()
    }

    /// Allocate a child budget id attributed to `parent_budget_id`.
    pub fn supply_child(&mut self, parent_budget_id: u64) -> u64 {
        let child_budget_id = (self.supply_budget_id)();
        self.children.insert(child_budget_id, parent_budget_id);

        tracing::trace!(child_budget_id, parent_budget_id, "child supplied");
        child_budget_id
    }

    /// Forget the child mapping once the configured linger has elapsed.
    pub fn cleanup_child(&mut self, child_budget_id: u64) {
        let deadline = self.children.schedule_removal(child_budget_id, Instant::now());
        tracing::trace!(
            child_budget_id,
            linger_ms = self.children.linger().as_millis() as u64,
            ?deadline,
            "child cleanup scheduled"
        );
    }

    /// Run the child cleanups due at `now`, returning how many were removed.
    pub fn expire_children(&mut self, now: Instant) -> usize {
        self.children.expire(now)
    }

    /// Earliest pending child cleanup.
    pub fn next_child_cleanup(&self) -> Option<Instant> {
        self.children.next_deadline()
    }

    /// Parent of a child budget, or `None` if unknown or cleaned up.
    pub fn parent_budget_id(&self, child_budget_id: u64) -> Option<u64> {
        self.children.parent(child_budget_id)
    }

    /// Number of budgets currently acquired.
    pub fn acquired(&self) -> usize {
        self.budget_index_by_id.len()
    }

    /// The partition's budget table.
    pub fn layout(&self) -> &Arc<BudgetsLayout> {
        &self.layout
    }
}

//! Budget worker: the per-thread home of one creditor and its debitors.
//!
//! The worker owns the creditor of its own partition and lazily creates one
//! debitor per partition it consumes from, always watching with its own
//! index as the watcher bit. Flushes and credit windows from other workers
//! arrive through its mailbox and are handled by [`BudgetWorker::poll`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::BudgetLayouts;
use crate::budget::{owner_index, BudgetCreditor, BudgetDebitor, BudgetIdSupplier, NO_BUDGET_ID};
use crate::flow::notify::{BudgetSignal, Mailbox, SignalBus};

/// Error type for worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {index}: some resources not released: {creditors} creditors, {debitors} debitors")]
    Leaked {
        index: usize,
        creditors: usize,
        debitors: usize,
    },
}

/// Budget state owned by one worker thread.
pub struct BudgetWorker {
    index: usize,
    layouts: BudgetLayouts,
    creditor: BudgetCreditor,
    debitors: HashMap<usize, BudgetDebitor>,
    bus: SignalBus,
    mailbox: Mailbox,
}

impl BudgetWorker {
    /// Create the worker owning the mailbox's partition.
    ///
    /// # Arguments
    ///
    /// * `layouts` - Budget tables of every partition
    /// * `bus` - Bus used to flush watchers and forward credit windows
    /// * `mailbox` - This worker's mailbox; its index is the owner index
    /// * `child_cleanup_linger` - Linger before child mappings are dropped
    pub fn new(
        layouts: BudgetLayouts,
        bus: SignalBus,
        mailbox: Mailbox,
        child_cleanup_linger: Duration,
    ) -> Self {
        let index = mailbox.index();
        let mut budget_ids = BudgetIdSupplier::new(index);
        let creditor = BudgetCreditor::new(
            index,
            Arc::clone(layouts.layout(index)),
            bus.clone(),
            move || budget_ids.supply(),
            child_cleanup_linger,
        );

        tracing::debug!(index, "budget worker created");

        Self {
            index,
            layouts,
            creditor,
            debitors: HashMap::new(),
            bus,
            mailbox,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn creditor(&self) -> &BudgetCreditor {
        &self.creditor
    }

    pub fn creditor_mut(&mut self) -> &mut BudgetCreditor {
        &mut self.creditor
    }

    /// Fresh budget id in this worker's partition.
    pub fn supply_budget_id(&mut self) -> u64 {
        self.creditor.supply_budget_id()
    }

    /// Debitor for the partition owning `budget_id`, created on first use.
    pub fn supply_debitor(&mut self, budget_id: u64) -> &mut BudgetDebitor {
        let owner = owner_index(budget_id);
        let watcher = self.index;
        let layouts = &self.layouts;
        self.debitors.entry(owner).or_insert_with(|| {
            tracing::debug!(watcher, owner, "budget debitor created");
            BudgetDebitor::new(watcher, owner, Arc::clone(layouts.layout(owner)))
        })
    }

    /// Debitor for `owner`, if one was created.
    pub fn debitor(&self, owner: usize) -> Option<&BudgetDebitor> {
        self.debitors.get(&owner)
    }

    /// Return `credit` to the worker owning `budget_id`.
    pub fn do_window(&self, trace_id: u64, budget_id: u64, credit: i64) {
        if budget_id != NO_BUDGET_ID && credit > 0 {
            tracing::trace!(trace_id, budget_id, credit, "window");
            if !self.bus.window(trace_id, budget_id, credit) {
                tracing::warn!(trace_id, budget_id, credit, "Window dropped, owner gone");
            }
        }
    }

    /// Handle pending signals and due child cleanups.
    ///
    /// Returns the amount of work done, 0 when idle.
    pub fn poll(&mut self, now: Instant) -> usize {
        let mut work = 0;
        while let Some(signal) = self.mailbox.try_recv() {
            self.on_signal(signal);
            work += 1;
        }
        work + self.creditor.expire_children(now)
    }

    fn on_signal(&mut self, signal: BudgetSignal) {
        match signal {
            BudgetSignal::Flush {
                trace_id,
                budget_id,
            } => self.on_flush(trace_id, budget_id),
            BudgetSignal::Window {
                trace_id,
                budget_id,
                credit,
            } => self.on_window(trace_id, budget_id, credit),
        }
    }

    fn on_flush(&mut self, trace_id: u64, budget_id: u64) {
        let owner = owner_index(budget_id);
        match self.debitors.get_mut(&owner) {
            Some(debitor) => debitor.flush(trace_id, budget_id),
            None => tracing::trace!(trace_id, budget_id, owner, "flush without debitor"),
        }
    }

    fn on_window(&mut self, trace_id: u64, budget_id: u64, credit: i64) {
        self.creditor.credit_by_id(trace_id, budget_id, credit);

        if let Some(parent_budget_id) = self.creditor.parent_budget_id(budget_id) {
            self.do_window(trace_id, parent_budget_id, credit);
        }
    }

    /// Shut the worker down, failing if budgets or registrations leaked.
    pub fn close(self) -> Result<(), WorkerError> {
        let creditors = self.creditor.acquired();
        let debitors = self.debitors.values().map(BudgetDebitor::acquired).sum();

        if creditors != 0 || debitors != 0 {
            return Err(WorkerError::Leaked {
                index: self.index,
                creditors,
                debitors,
            });
        }

        tracing::debug!(index = self.index, "budget worker closed");
        Ok(())
    }
}

//! Signal bus between budget workers.
//!
//! Each worker drains its own mailbox on its own thread:
//! - `Flush` wakes the watchers a worker registered on a credited budget
//! - `Window` carries credit back to the worker owning a budget
//!
//! Sending never blocks, so a creditor can dispatch flushes from the middle
//! of a credit without waiting on the receiving worker.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::budget::{owner_index, FlushDispatcher, MAX_WATCHERS};

/// Signal addressed to one budget worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    /// A watched budget was credited; retry claims against it.
    Flush { trace_id: u64, budget_id: u64 },
    /// Credit for a budget owned by the receiving worker.
    Window {
        trace_id: u64,
        budget_id: u64,
        credit: i64,
    },
}

impl BudgetSignal {
    pub fn trace_id(&self) -> u64 {
        match *self {
            Self::Flush { trace_id, .. } | Self::Window { trace_id, .. } => trace_id,
        }
    }

    pub fn budget_id(&self) -> u64 {
        match *self {
            Self::Flush { budget_id, .. } | Self::Window { budget_id, .. } => budget_id,
        }
    }
}

/// Sending half of the bus, shared by every worker.
#[derive(Clone, Debug)]
pub struct SignalBus {
    senders: Arc<[UnboundedSender<BudgetSignal>]>,
}

/// Receiving half of the bus for one worker.
#[derive(Debug)]
pub struct Mailbox {
    index: usize,
    receiver: UnboundedReceiver<BudgetSignal>,
}

impl SignalBus {
    /// Create a bus for `workers` workers, returning one mailbox per worker.
    ///
    /// Mailbox `i` receives what is sent to worker `i`.
    #[must_use]
    pub fn new(workers: usize) -> (Self, Vec<Mailbox>) {
        let (senders, mailboxes): (Vec<_>, Vec<_>) = (0..workers)
            .map(|index| {
                let (sender, receiver) = mpsc::unbounded_channel();
                (sender, Mailbox { index, receiver })
            })
            .unzip();

        (
            Self {
                senders: senders.into(),
            },
            mailboxes,
        )
    }

    /// Number of workers reachable through the bus.
    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Send `signal` to worker `index`.
    ///
    /// Returns false if the worker is unknown or its mailbox was dropped.
    pub fn send(&self, index: usize, signal: BudgetSignal) -> bool {
        self.senders
            .get(index)
            .is_some_and(|sender| sender.send(signal).is_ok())
    }

    /// Send `Window` to the worker owning `budget_id`.
    pub fn window(&self, trace_id: u64, budget_id: u64, credit: i64) -> bool {
        self.send(
            owner_index(budget_id),
            BudgetSignal::Window {
                trace_id,
                budget_id,
                credit,
            },
        )
    }

    /// Send `Flush` to every worker whose bit is set in `watchers`.
    ///
    /// Returns the number of flushes delivered.
    pub fn flush_watchers(&self, trace_id: u64, budget_id: u64, watchers: u64) -> usize {
        (0..MAX_WATCHERS)
            .filter(|watcher_index| watchers & (1 << watcher_index) != 0)
            .filter(|&watcher_index| {
                tracing::trace!(trace_id, budget_id, watcher_index, "flush");
                self.send(
                    watcher_index,
                    BudgetSignal::Flush {
                        trace_id,
                        budget_id,
                    },
                )
            })
            .count()
    }
}

impl FlushDispatcher for SignalBus {
    fn flush(&self, trace_id: u64, budget_id: u64, watchers: u64) {
        self.flush_watchers(trace_id, budget_id, watchers);
    }
}

impl Mailbox {
    /// Worker index this mailbox belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next pending signal, without waiting.
    pub fn try_recv(&mut self) -> Option<BudgetSignal> {
        self.receiver.try_recv().ok()
    }
}

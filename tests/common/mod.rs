//! Test utilities for creditflow integration tests.
//!
//! Provides:
//! - Temporary directories for file-backed budget tables
//! - Creditor and debitor construction over shared tables
//! - Flush recorders standing in for the signal bus

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use creditflow::budget::{budget_mask, BudgetCreditor, BudgetDebitor, BudgetsLayout};
use tempfile::TempDir;

/// Test fixture that manages a temporary table directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for budget tables
    pub temp_dir: TempDir,
}

impl TestFixture {
    /// Create a new test fixture with a temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        Self { temp_dir }
    }

    /// Path of a table file inside the fixture directory.
    pub fn table_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Flushes recorded as `(trace_id, budget_id, watchers)`.
pub type FlushLog = Arc<Mutex<Vec<(u64, u64, u64)>>>;

/// Anonymous table shared by creditor and debitors.
pub fn layout(capacity: usize) -> Arc<BudgetsLayout> {
    Arc::new(BudgetsLayout::anonymous(capacity).expect("failed to map budget table"))
}

/// Creditor for `owner` that records every flush and supplies ids from 1.
pub fn creditor(
    owner: usize,
    layout: &Arc<BudgetsLayout>,
    linger: Duration,
) -> (BudgetCreditor, FlushLog) {
    let flushes = FlushLog::default();
    let recorder = Arc::clone(&flushes);
    let mut next_id = budget_mask(owner);

    let creditor = BudgetCreditor::new(
        owner,
        Arc::clone(layout),
        move |trace_id: u64, budget_id: u64, watchers: u64| {
            recorder.lock().unwrap().push((trace_id, budget_id, watchers));
        },
        move || {
            next_id += 1;
            next_id
        },
        linger,
    );
    (creditor, flushes)
}

/// Debitor watching as `watcher` on `owner`'s table.
pub fn debitor(watcher: usize, owner: usize, layout: &Arc<BudgetsLayout>) -> BudgetDebitor {
    BudgetDebitor::new(watcher, owner, Arc::clone(layout))
}

/// Flusher that counts its invocations.
pub fn counting_flusher() -> (Arc<AtomicU64>, impl FnMut(u64) + Send + 'static) {
    let count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&count);
    (count, move |_trace_id: u64| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

/// Budget id `n` of `owner`'s partition.
pub fn budget_id(owner: usize, n: u64) -> u64 {
    budget_mask(owner) | n
}

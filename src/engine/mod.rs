//! Hosting glue for budgets: one worker per owner partition.
//!
//! - [`BudgetLayouts`]: the per-partition budget tables, shared by all workers
//! - [`BudgetWorker`]: creditor, debitors and mailbox of one worker

pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::budget::{BudgetsLayout, LayoutError, MAX_OWNERS, MAX_WATCHERS};

pub use worker::{BudgetWorker, WorkerError};

/// Budget tables of every owner partition, indexed by owner.
#[derive(Debug, Clone)]
pub struct BudgetLayouts {
    layouts: Arc<[Arc<BudgetsLayout>]>,
}

impl BudgetLayouts {
    /// In-process tables for `workers` partitions.
    pub fn anonymous(workers: usize, capacity: usize) -> Result<Self, LayoutError> {
        Self::check_workers(workers);
        let layouts = (0..workers)
            .map(|_| BudgetsLayout::anonymous(capacity).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            layouts: layouts.into(),
        })
    }

    /// File-backed tables `budgets{index}` created in `directory`.
    pub fn create_in(directory: &Path, workers: usize, capacity: usize) -> Result<Self, LayoutError> {
        Self::check_workers(workers);
        let layouts = (0..workers)
            .map(|index| BudgetsLayout::create(layout_path(directory, index), capacity).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            layouts: layouts.into(),
        })
    }

    fn check_workers(workers: usize) {
        assert!(
            (1..=MAX_WATCHERS.min(MAX_OWNERS)).contains(&workers),
            "unsupported worker count {workers}"
        );
    }

    /// Table of the given owner partition.
    ///
    /// # Panics
    ///
    /// Panics if no such partition exists.
    pub fn layout(&self, owner_index: usize) -> &Arc<BudgetsLayout> {
        &self.layouts[owner_index]
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Path of the layout file for `owner_index` inside `directory`.
pub fn layout_path(directory: &Path, owner_index: usize) -> PathBuf {
    directory.join(format!("budgets{owner_index}"))
}

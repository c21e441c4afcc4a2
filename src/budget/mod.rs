//! Credit-based budgets shared between creditors and debitors.
//!
//! Provides:
//! - A fixed-capacity table of budget slots over shared memory
//! - A creditor that owns slot allocation for one owner partition
//! - Debitors that claim capacity and watch for more
//! - Child budget bookkeeping with lingering cleanup
//!
//! Every budget id and budget index carries the owner partition in its top
//! byte, so an index can never be used against another partition's table.

pub mod child;
pub mod creditor;
pub mod debitor;
pub mod id;
pub mod layout;

use std::fmt;

pub use child::ChildBudgets;
pub use creditor::{BudgetCreditor, FlushDispatcher};
pub use debitor::BudgetDebitor;
pub use id::BudgetIdSupplier;
pub use layout::{BudgetSlot, BudgetsLayout, LayoutError, SlotSnapshot, SLOT_SIZE};

/// Budget id reserved for "no budget". Free slots hold this id.
pub const NO_BUDGET_ID: u64 = 0;

/// Raw sentinel for "no budget index", for callers carrying indices as `u64`.
pub const NO_BUDGET_INDEX: u64 = u64::MAX;

/// Bit position of the owner partition tag.
pub const OWNER_SHIFT: u32 = 56;

/// Maximum number of owner partitions addressable by the tag.
pub const MAX_OWNERS: usize = 1 << (u64::BITS - OWNER_SHIFT);

/// Maximum number of distinguishable watchers per partition (one bit each).
pub const MAX_WATCHERS: usize = u64::BITS as usize;

const SLOT_MASK: u64 = (1 << OWNER_SHIFT) - 1;

/// Owner partition tag for the given owner index.
#[must_use]
pub const fn budget_mask(owner_index: usize) -> u64 {
    (owner_index as u64) << OWNER_SHIFT
}

/// Owner partition encoded in a budget id or raw budget index.
#[must_use]
pub const fn owner_index(budget_id: u64) -> usize {
    (budget_id >> OWNER_SHIFT) as usize
}

/// Handle to a live slot: owner tag in the top byte, slot position below.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BudgetIndex(u64);

impl BudgetIndex {
    pub(crate) const fn new(owner_index: usize, slot: usize) -> Self {
        Self(budget_mask(owner_index) | slot as u64)
    }

    /// Rebuild an index previously obtained from [`BudgetIndex::as_u64`].
    ///
    /// Returns `None` for the [`NO_BUDGET_INDEX`] sentinel.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == NO_BUDGET_INDEX {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw representation, suitable for carrying in frames.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Owner partition this index belongs to.
    #[must_use]
    pub const fn owner_index(self) -> usize {
        owner_index(self.0)
    }

    /// Slot position after asserting the index belongs to `owner_index`.
    pub(crate) fn slot(self, owner_index: usize) -> usize {
        assert_eq!(
            self.owner_index(),
            owner_index,
            "budget index {self:?} used outside its owner partition"
        );
        (self.0 & SLOT_MASK) as usize
    }
}

impl fmt::Debug for BudgetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BudgetIndex({:#018x})", self.0)
    }
}

/// Starting slot of the probe sequence for `budget_id`.
///
/// Creditor and debitor must agree on this, otherwise a debitor would not
/// find budgets the creditor placed away from their home slot.
pub(crate) fn probe_start(budget_id: u64, entries_mask: usize) -> usize {
    let hash = budget_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((hash ^ (hash >> 32)) as usize) & entries_mask
}

//! Shared budget table over a memory mapping.
//!
//! The table is a power-of-two array of 24-byte slots:
//!
//! ```text
//! +0   budget_id  u64   0 while the slot is free
//! +8   remaining  i64   credit balance
//! +16  watchers   u64   one bit per watching debitor
//! ```
//!
//! The mapping is either anonymous (one process, many threads) or backed by a
//! file so that independent mappings of the same file observe the same slots.
//! No business logic lives here; creditors and debitors interpret the slots.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use memmap2::MmapMut;
use serde::Serialize;
use thiserror::Error;

use super::{owner_index, SLOT_MASK};

/// Size in bytes of one slot in the table.
pub const SLOT_SIZE: usize = std::mem::size_of::<BudgetSlot>();

const _: () = assert!(SLOT_SIZE == 24);

/// Error type for budget layout operations.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Failed to map budgets layout: {0}")]
    Io(#[from] io::Error),

    #[error("Budgets capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Budgets layout {} has length {len}, not a power-of-two count of slots", .path.display())]
    Malformed { path: PathBuf, len: u64 },
}

/// One slot of the budget table.
#[repr(C)]
#[derive(Debug)]
pub struct BudgetSlot {
    budget_id: AtomicU64,
    remaining: AtomicI64,
    watchers: AtomicU64,
}

impl BudgetSlot {
    /// Budget id occupying this slot, or 0 if free.
    pub fn budget_id(&self) -> u64 {
        self.budget_id.load(Ordering::SeqCst)
    }

    /// Current credit balance. May be stale as soon as it is read.
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Bitmask of debitors currently watching this budget.
    pub fn watchers(&self) -> u64 {
        self.watchers.load(Ordering::SeqCst)
    }

    pub(crate) fn compare_exchange_budget_id(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.budget_id
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub(crate) fn swap_budget_id(&self, new: u64) -> u64 {
        self.budget_id.swap(new, Ordering::SeqCst)
    }

    /// Adds `delta` to the balance, returning the previous balance.
    pub(crate) fn get_and_add_remaining(&self, delta: i64) -> i64 {
        self.remaining.fetch_add(delta, Ordering::SeqCst)
    }

    pub(crate) fn set_remaining(&self, remaining: i64) {
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    pub(crate) fn compare_exchange_watchers(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.watchers
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub(crate) fn set_watchers(&self, watchers: u64) {
        self.watchers.store(watchers, Ordering::SeqCst);
    }
}

/// Point-in-time copy of a live slot, for inspection and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub budget_id: u64,
    pub owner: usize,
    pub remaining: i64,
    pub watchers: u64,
}

/// Budget table shared by every creditor and debitor of one owner partition.
///
/// Share it with `Arc`; the mapping is released when the last handle drops.
pub struct BudgetsLayout {
    map: MmapMut,
    slots: NonNull<BudgetSlot>,
    capacity: usize,
    path: Option<PathBuf>,
}

// SAFETY: the mapped bytes are only touched through the atomics in
// `BudgetSlot`, and the mapping is never resized or remapped after creation.
unsafe impl Send for BudgetsLayout {}
// SAFETY: see above; shared access only ever performs atomic operations.
unsafe impl Sync for BudgetsLayout {}

impl BudgetsLayout {
    /// Create an in-process table with `capacity` zeroed slots.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is not a non-zero power of two or the
    /// mapping cannot be created.
    pub fn anonymous(capacity: usize) -> Result<Self, LayoutError> {
        let len = Self::length_of(capacity)?;
        let map = MmapMut::map_anon(len)?;
        Ok(Self::from_map(map, capacity, None))
    }

    /// Create (or truncate) the layout file at `path` and map it.
    ///
    /// This is the owner side: any previous content of the file is discarded.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, LayoutError> {
        let path = path.as_ref();
        let len = Self::length_of(capacity)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was sized above and is not truncated while mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_map(map, capacity, Some(path.to_path_buf())))
    }

    /// Attach to an existing layout file created by [`BudgetsLayout::create`].
    pub fn attach<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        let malformed = || LayoutError::Malformed {
            path: path.to_path_buf(),
            len,
        };
        if len % SLOT_SIZE as u64 != 0 {
            return Err(malformed());
        }
        let capacity = usize::try_from(len / SLOT_SIZE as u64).map_err(|_| malformed())?;
        Self::length_of(capacity).map_err(|_| malformed())?;

        // SAFETY: the length was validated above; the owner never truncates a
        // layout file while it is attached.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_map(map, capacity, Some(path.to_path_buf())))
    }

    fn length_of(capacity: usize) -> Result<usize, LayoutError> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity as u64 > SLOT_MASK + 1 {
            return Err(LayoutError::InvalidCapacity(capacity));
        }
        capacity
            .checked_mul(SLOT_SIZE)
            .ok_or(LayoutError::InvalidCapacity(capacity))
    }

    fn from_map(mut map: MmapMut, capacity: usize, path: Option<PathBuf>) -> Self {
        // Mappings are page aligned, which satisfies the 8-byte alignment of
        // the slot atomics; fresh mappings are zero-filled, i.e. all slots free.
        let slots = NonNull::from(&mut map[..]).cast::<BudgetSlot>();
        Self {
            map,
            slots,
            capacity,
            path,
        }
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backing file, if the table is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Access the slot at position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the table.
    pub fn slot(&self, index: usize) -> &BudgetSlot {
        &self.slots()[index]
    }

    /// All slots of the table.
    pub fn slots(&self) -> &[BudgetSlot] {
        // SAFETY: the mapping spans exactly `capacity` slots and lives as long
        // as `self`; slots are only mutated through atomics.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.capacity) }
    }

    /// Copy out every live slot.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let budget_id = entry.budget_id();
                (budget_id != 0).then(|| SlotSnapshot {
                    slot,
                    budget_id,
                    owner: owner_index(budget_id),
                    remaining: entry.remaining(),
                    watchers: entry.watchers(),
                })
            })
            .collect()
    }

    /// Persist a file-backed table to disk. No-op for anonymous tables.
    pub fn flush(&self) -> Result<(), LayoutError> {
        if self.path.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }
}

impl fmt::Debug for BudgetsLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetsLayout")
            .field("capacity", &self.capacity)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

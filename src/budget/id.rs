//! Budget id supply for one owner partition.

use super::budget_mask;

/// Bits of a budget id reserved above the sequence (owner tag and spare).
const RESERVED_BITS: u32 = 33;

/// Generates budget ids tagged with an owner partition.
///
/// Ids are `owner << 56 | n` where `n` cycles through `1..2^31`. The bare
/// owner tag is skipped on wrap-around, so owner 0 never yields id 0.
#[derive(Debug, Clone)]
pub struct BudgetIdSupplier {
    initial: u64,
    mask: u64,
    current: u64,
}

impl BudgetIdSupplier {
    /// Create a supplier for the given owner partition.
    pub fn new(owner_index: usize) -> Self {
        let initial = budget_mask(owner_index);
        Self {
            initial,
            mask: initial | (u64::MAX >> RESERVED_BITS),
            current: initial,
        }
    }

    /// Next budget id for this partition.
    pub fn supply(&mut self) -> u64 {
        self.current = (self.current + 1) & self.mask;
        if self.current == self.initial {
            self.current += 1;
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::owner_index;

    #[test]
    fn test_ids_carry_owner_tag() {
        let mut supplier = BudgetIdSupplier::new(3);
        let first = supplier.supply();
        let second = supplier.supply();

        assert_eq!(owner_index(first), 3);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_wrap_skips_zero() {
        let mut supplier = BudgetIdSupplier::new(0);
        supplier.current = u64::MAX >> RESERVED_BITS;

        assert_eq!(supplier.supply(), 1);
    }
}

//! Child budget bookkeeping.
//!
//! A child budget (one stream inside one connection, say) stays attributable
//! to its parent budget. Cleanup never removes the mapping synchronously:
//! removal is queued for `now + linger` so late credits and claims that still
//! reference the child resolve its parent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::flow::timer::TimerQueue;

/// Map of child budget id to parent budget id with lingering removal.
#[derive(Debug)]
pub struct ChildBudgets {
    parents: HashMap<u64, u64>,
    linger: Duration,
    pending: TimerQueue<u64>,
}

impl ChildBudgets {
    /// Create an empty registry whose removals linger for `linger`.
    pub fn new(linger: Duration) -> Self {
        Self {
            parents: HashMap::new(),
            linger,
            pending: TimerQueue::new(),
        }
    }

    /// Record `child` as a sub-budget of `parent`.
    pub fn insert(&mut self, child: u64, parent: u64) {
        self.parents.insert(child, parent);
    }

    /// Parent of `child`, if the mapping has not been removed yet.
    pub fn parent(&self, child: u64) -> Option<u64> {
        self.parents.get(&child).copied()
    }

    /// Queue removal of `child` for `now + linger`, returning the deadline.
    pub fn schedule_removal(&mut self, child: u64, now: Instant) -> Instant {
        let deadline = now + self.linger;
        self.pending.schedule(deadline, child);
        deadline
    }

    /// Remove every child whose linger has elapsed at `now`.
    ///
    /// Returns the number of mappings removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(timer) = self.pending.poll_expired(now) {
            if self.parents.remove(&timer.into_inner()).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Earliest pending removal deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Configured linger.
    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Number of live child mappings, including those lingering.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_waits_for_linger() {
        let mut children = ChildBudgets::new(Duration::from_millis(50));
        children.insert(7, 42);

        let now = Instant::now();
        let deadline = children.schedule_removal(7, now);
        assert_eq!(deadline, now + Duration::from_millis(50));

        assert_eq!(children.expire(now + Duration::from_millis(49)), 0);
        assert_eq!(children.parent(7), Some(42));

        assert_eq!(children.expire(deadline), 1);
        assert_eq!(children.parent(7), None);
        assert!(children.is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown_removals_are_harmless() {
        let mut children = ChildBudgets::new(Duration::ZERO);
        children.insert(1, 10);

        let now = Instant::now();
        children.schedule_removal(1, now);
        children.schedule_removal(1, now);
        children.schedule_removal(99, now);

        assert_eq!(children.expire(now), 1);
        assert!(children.next_deadline().is_none());
    }
}

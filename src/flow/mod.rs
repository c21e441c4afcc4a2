//! Flow control plumbing around the budget table.
//!
//! Provides:
//! - Signal bus carrying flushes and credit windows between workers
//! - Timer queue for deferred work drained by its owning thread

pub mod notify;
pub mod timer;

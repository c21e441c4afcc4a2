//! Creditflow: credit-based flow control over shared budget tables.
//!
//! Producers credit budgets they own; consumers on other threads claim
//! credit from them without locks. A consumer left short becomes a watcher
//! and is flushed when the budget is credited again.
//!
//! # Architecture
//!
//! - **Shared tables**: one memory-mapped table of budget slots per owner
//! - **Lock-free claims**: atomic add with roll-forward or roll-back
//! - **Watcher mask**: one bit per worker says whom to flush
//! - **Child budgets**: windows on a child also credit its parent
//!
//! # Modules
//!
//! - [`budget`]: Budget table, creditor and debitor
//! - [`config`]: CLI and environment configuration
//! - [`engine`]: Per-worker hosting of creditors and debitors
//! - [`flow`]: Signal bus and timer queue
//! - [`observability`]: Tracing setup
//! - [`runner`]: Load driver and run report

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // budget::BudgetCreditor is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::cast_possible_truncation,   // Slot and watcher indices fit
    clippy::similar_names,              // budget_id/budget_ids are fine
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod budget;
pub mod config;
pub mod engine;
pub mod flow;
pub mod observability;
pub mod runner;

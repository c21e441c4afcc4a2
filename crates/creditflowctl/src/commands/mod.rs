//! Subcommand implementations.

pub mod budgets;
pub mod summary;

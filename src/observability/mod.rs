//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing to stderr, filtered by `RUST_LOG`

pub mod tracing;

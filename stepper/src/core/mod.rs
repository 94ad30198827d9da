//! Deterministic, pure logic shared by the step engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod lifecycle;
pub mod log_metrics;
pub mod naming;
pub mod rollback_plan;
pub mod types;

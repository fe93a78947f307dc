//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans, ledgers and states and return deterministic outputs suitable for tests.

pub mod choices;
pub mod classifier;
pub mod dependencies;
pub mod failure_summary;
pub mod resume_point;
pub mod sanitize;
pub mod splice;
pub mod types;
pub mod vote;

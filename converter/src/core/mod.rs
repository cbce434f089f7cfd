//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (output lines, countdown state, run results) and return
//! deterministic outputs suitable for tests.

pub mod countdown;
pub mod outcome;
pub mod sentinel;
pub mod types;

//! Staged conversion pipeline orchestrator.
//!
//! Drives an external, non-interactive batch engine over a set of work units:
//! every unit runs an ordered list of stages, each stage renders a script,
//! runs the engine under a liveness watchdog and leaves a marker so reruns
//! only repeat incomplete work. Afterwards unit artifacts are merged into one
//! shared destination.
//!
//! - **[`core`]**: Pure, deterministic logic (line classification, countdown,
//!   outcome classification). No I/O.
//! - **[`io`]**: Side-effecting operations (config, processes, markers,
//!   filesystem, destination store).
//!
//! Orchestration modules ([`stage`], [`pipeline`], [`merge`], [`batch`])
//! combine the two to implement the CLI commands.

pub mod batch;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

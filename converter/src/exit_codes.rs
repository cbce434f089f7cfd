//! Stable exit codes for converter CLI commands.

/// The batch finished and every stage and merge was clean.
pub const OK: i32 = 0;
/// The batch finished with warnings, hard failures or merge failures.
pub const FAILED: i32 = 1;
/// Invalid configuration or another error that stopped the run.
pub const INVALID: i32 = 2;

//! Classification of a finished engine run into a stage status.

use crate::core::types::{StageStatus, Termination};

/// Decide the stage status from how the engine ended and whether any
/// sentinel line was seen.
///
/// - Forced termination or an exit code other than `success_exit_code` is a hard failure.
/// - A clean exit with flagged output completes with warnings.
/// - A clean exit without flagged output succeeds.
pub fn classify_run(termination: Termination, flagged: bool, success_exit_code: i32) -> StageStatus {
    match termination {
        Termination::Forced => StageStatus::HardFailure,
        Termination::Exited { code } if code != Some(success_exit_code) => StageStatus::HardFailure,
        Termination::Exited { .. } if flagged => StageStatus::CompletedWithWarnings,
        Termination::Exited { .. } => StageStatus::Succeeded,
    }
}

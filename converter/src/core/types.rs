//! Shared deterministic types for the conversion pipeline.
//!
//! These types define stable contracts between the supervisor, the stage
//! runner and the controller. They serialize into markers and batch reports,
//! so variant names must stay stable.

use serde::{Deserialize, Serialize};

/// Classification of a single line of engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSignal {
    /// Ordinary progress output.
    Plain,
    /// The engine reported an error but keeps running.
    Error,
    /// The engine announced it is stopping the script.
    Abort,
    /// The engine is waiting for an operator answer that will never come.
    Prompt,
}

impl LineSignal {
    /// True for every signal that makes a stage "completed with warnings".
    pub fn is_flagged(self) -> bool {
        !matches!(self, LineSignal::Plain)
    }
}

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Termination {
    /// The process exited on its own. `code` is `None` when it was ended by a signal.
    Exited { code: Option<i32> },
    /// The liveness countdown expired and the process tree was killed.
    Forced,
}

/// Result of applying one stage to one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Marker already present; the engine was not invoked.
    AlreadyDone,
    /// Clean exit, no flagged output. Marker written.
    Succeeded,
    /// Clean exit with flagged output (or a failed post-stage hook). Marker written.
    CompletedWithWarnings,
    /// Forced termination, unexpected exit status, or engine I/O failure. No marker.
    HardFailure,
    /// Skipped because an earlier stage hard-failed and continuation is disabled.
    NotRun,
}

impl StageStatus {
    /// Whether the stage leaves a marker behind.
    pub fn writes_marker(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::CompletedWithWarnings
        )
    }

    /// Whether the stage keeps the batch "all clean".
    pub fn is_clean(self) -> bool {
        matches!(self, StageStatus::AlreadyDone | StageStatus::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::AlreadyDone => "already_done",
            StageStatus::Succeeded => "succeeded",
            StageStatus::CompletedWithWarnings => "completed_with_warnings",
            StageStatus::HardFailure => "hard_failure",
            StageStatus::NotRun => "not_run",
        }
    }
}

/// Per-unit accumulation of stage outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTally {
    pub already_done: u32,
    pub succeeded: u32,
    pub warnings: u32,
    pub failures: u32,
    pub not_run: u32,
}

impl UnitTally {
    pub fn record(&mut self, status: StageStatus) {
        match status {
            StageStatus::AlreadyDone => self.already_done += 1,
            StageStatus::Succeeded => self.succeeded += 1,
            StageStatus::CompletedWithWarnings => self.warnings += 1,
            StageStatus::HardFailure => self.failures += 1,
            StageStatus::NotRun => self.not_run += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings == 0 && self.failures == 0 && self.not_run == 0
    }
}

//! Pipeline controller: drive every (unit, stage) pair in order.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::types::{StageStatus, UnitTally};
use crate::io::engine::Engine;
use crate::io::marker::marker_path;
use crate::io::units::WorkUnit;
use crate::stage::{Stage, StageReport, StageSettings, run_stage};

/// All stages applied to one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub tally: UnitTally,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    /// No stage of any unit warned, failed or was left unrun.
    pub all_clean: bool,
    pub units: Vec<UnitReport>,
}

pub struct Pipeline<'a, E: Engine> {
    engine: &'a E,
    stages: &'a [Stage],
    settings: StageSettings,
    continue_on_failure: bool,
}

impl<'a, E: Engine> Pipeline<'a, E> {
    pub fn new(
        engine: &'a E,
        stages: &'a [Stage],
        settings: StageSettings,
        continue_on_failure: bool,
    ) -> Self {
        Self {
            engine,
            stages,
            settings,
            continue_on_failure,
        }
    }

    /// Process units one after another. Only configuration errors abort.
    pub fn run(&self, units: &[WorkUnit]) -> Result<PipelineOutcome> {
        let mut reports = Vec::with_capacity(units.len());
        for (idx, unit) in units.iter().enumerate() {
            info!(unit = %unit.id, position = idx + 1, total = units.len(), "processing unit");
            reports.push(self.run_unit(unit)?);
        }
        Ok(PipelineOutcome {
            all_clean: reports.iter().all(|report| report.tally.is_clean()),
            units: reports,
        })
    }

    pub fn run_unit(&self, unit: &WorkUnit) -> Result<UnitReport> {
        let mut tally = UnitTally::default();
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut halted = false;

        for stage in self.stages {
            let report = if halted {
                StageReport::not_executed(
                    &stage.name,
                    StageStatus::NotRun,
                    marker_path(&unit.workdir, &stage.name),
                )
            } else {
                run_stage(self.engine, &self.settings, unit, stage)?
            };
            if report.status == StageStatus::HardFailure && !self.continue_on_failure {
                warn!(unit = %unit.id, stage = %stage.name, "halting unit after hard failure");
                halted = true;
            }
            tally.record(report.status);
            stages.push(report);
        }

        if tally.is_clean() {
            info!(
                unit = %unit.id,
                succeeded = tally.succeeded,
                already_done = tally.already_done,
                "unit done"
            );
        } else {
            warn!(
                unit = %unit.id,
                succeeded = tally.succeeded,
                already_done = tally.already_done,
                warnings = tally.warnings,
                failures = tally.failures,
                not_run = tally.not_run,
                "unit done with problems"
            );
        }
        Ok(UnitReport {
            unit: unit.id.clone(),
            tally,
            stages,
        })
    }
}

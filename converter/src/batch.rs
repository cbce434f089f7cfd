//! Top-level batch run: resolve, preflight, per-unit stages, merge, report.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::errors::ConfigError;
use crate::io::config::{PipelineConfig, UnitsConfig};
use crate::io::destination::{Destination, DirectoryStore};
use crate::io::engine::Engine;
use crate::io::report::write_batch_report;
use crate::io::template::{TemplateVars, render_args};
use crate::io::units::{WorkUnit, enumerate_units, resolve_units};
use crate::merge::{MergeReport, merge_units};
use crate::pipeline::{Pipeline, UnitReport};
use crate::stage::{Stage, StageSettings, load_stages};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Restrict the run to these units; empty means every configured unit.
    pub only_units: Vec<String>,
    pub skip_merge: bool,
}

/// Stages and units that passed preflight.
#[derive(Debug)]
pub struct PreparedBatch {
    pub stages: Vec<Stage>,
    pub units: Vec<WorkUnit>,
    pub settings: StageSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every stage clean and every merge item merged or absent.
    pub all_clean: bool,
    pub units: Vec<UnitReport>,
    pub merge: Option<MergeReport>,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

/// Run a batch against the configured directory-backed destination.
pub fn run_batch<E: Engine>(
    cfg: &PipelineConfig,
    engine: &E,
    options: &BatchOptions,
) -> Result<BatchReport> {
    let prepared = prepare_batch(cfg, options)?;
    let store = match &cfg.merge {
        Some(merge) if !options.skip_merge => Some(DirectoryStore::open_or_create(
            &merge.destination,
            merge.template.as_deref(),
        )?),
        _ => None,
    };
    execute_batch(cfg, &prepared, engine, store.as_ref())
}

/// Load stage templates, resolve units and render everything once, so that
/// configuration errors surface before any engine runs.
pub fn prepare_batch(cfg: &PipelineConfig, options: &BatchOptions) -> Result<PreparedBatch> {
    let stages = load_stages(cfg)?;
    let units = select_units(&cfg.units, &options.only_units)?;
    let settings = StageSettings::from_config(cfg);
    preflight(&stages, &units, &settings)?;
    info!(units = units.len(), stages = stages.len(), "batch prepared");
    Ok(PreparedBatch {
        stages,
        units,
        settings,
    })
}

fn select_units(cfg: &UnitsConfig, only: &[String]) -> Result<Vec<WorkUnit>> {
    if only.is_empty() {
        return resolve_units(cfg);
    }
    let known: BTreeSet<String> = enumerate_units(cfg)?.into_iter().collect();
    if let Some(unknown) = only.iter().find(|name| !known.contains(*name)) {
        return Err(ConfigError::Invalid(format!("unit {unknown:?} is not part of the batch")).into());
    }
    let narrowed = UnitsConfig {
        pattern: None,
        names: only.to_vec(),
        ..cfg.clone()
    };
    resolve_units(&narrowed)
}

fn preflight(stages: &[Stage], units: &[WorkUnit], settings: &StageSettings) -> Result<(), ConfigError> {
    for unit in units {
        let vars = TemplateVars::new(&unit.id, &unit.source_dir, &unit.workdir);
        for stage in stages {
            stage.template.render(&vars)?;
            let script = settings.nominal_script_path(unit, &stage.name);
            render_args(&settings.engine_args, &vars.clone().with_script(&script))?;
            if let Some(hook) = &stage.post_hook {
                hook.check(&vars)?;
            }
        }
    }
    Ok(())
}

/// Run the per-unit phase, then merge into `destination` when one is given.
#[instrument(skip_all, fields(units = prepared.units.len()))]
pub fn execute_batch<E: Engine, D: Destination>(
    cfg: &PipelineConfig,
    prepared: &PreparedBatch,
    engine: &E,
    destination: Option<&D>,
) -> Result<BatchReport> {
    let started_at = Utc::now();
    let pipeline = Pipeline::new(
        engine,
        &prepared.stages,
        prepared.settings.clone(),
        cfg.continue_on_failure,
    );
    let outcome = pipeline.run(&prepared.units)?;

    let merge = match (&cfg.merge, destination) {
        (Some(merge_cfg), Some(destination)) => {
            Some(merge_units(destination, &prepared.units, merge_cfg))
        }
        _ => None,
    };
    let merge_clean = merge.as_ref().is_none_or(|report| report.failures == 0);

    let mut report = BatchReport {
        started_at,
        finished_at: Utc::now(),
        all_clean: outcome.all_clean && merge_clean,
        units: outcome.units,
        merge,
        report_path: None,
    };
    match write_batch_report(&cfg.reports_dir(), started_at, &report) {
        Ok(path) => report.report_path = Some(path),
        Err(err) => warn!(err = %format!("{err:#}"), "write batch report"),
    }

    if report.all_clean {
        info!(units = report.units.len(), "batch finished clean");
    } else {
        warn!(units = report.units.len(), "batch finished with warnings or failures");
    }
    Ok(report)
}

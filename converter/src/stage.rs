//! Stage runner: idempotently apply one stage to one work unit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempPath;
use tracing::{error, info, instrument, warn};

use crate::core::outcome::classify_run;
use crate::core::types::{StageStatus, Termination};
use crate::errors::{ConfigError, is_config_error};
use crate::hooks::{CommandHook, HookOutcome, HookRequest, PostStageHook};
use crate::io::command::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::config::{PipelineConfig, StageConfig};
use crate::io::engine::{Engine, EngineRequest};
use crate::io::marker::{MarkerRecord, marker_path, write_marker};
use crate::io::report::{engine_log_path, hook_log_path, write_engine_log};
use crate::io::supervisor::FlaggedLine;
use crate::io::template::{ScriptTemplate, TemplateVars, render_args};
use crate::io::units::WorkUnit;

/// One named pipeline step.
#[derive(Debug)]
pub struct Stage {
    pub name: String,
    pub template: ScriptTemplate,
    pub post_hook: Option<Box<dyn PostStageHook>>,
}

impl Stage {
    pub fn new(name: impl Into<String>, template: ScriptTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            post_hook: None,
        }
    }

    pub fn with_post_hook(mut self, hook: impl PostStageHook + 'static) -> Self {
        self.post_hook = Some(Box::new(hook));
        self
    }

    pub fn from_config(cfg: &StageConfig) -> Result<Self, ConfigError> {
        let stage = Self::new(&cfg.name, ScriptTemplate::load(&cfg.name, &cfg.template)?);
        if cfg.post_hook.is_empty() {
            Ok(stage)
        } else {
            Ok(stage.with_post_hook(CommandHook::new(cfg.post_hook.clone())))
        }
    }
}

/// Build the ordered stage list, loading every template file.
pub fn load_stages(cfg: &PipelineConfig) -> Result<Vec<Stage>, ConfigError> {
    cfg.stages.iter().map(Stage::from_config).collect()
}

/// Engine-facing settings shared by every stage of a batch.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub engine_args: Vec<String>,
    pub script_extension: String,
    pub success_exit_code: i32,
    pub hook_timeout: Duration,
}

impl StageSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            engine_args: cfg.engine.args.clone(),
            script_extension: cfg.engine.script_extension.clone(),
            success_exit_code: cfg.engine.success_exit_code,
            hook_timeout: Duration::from_secs(cfg.hook_timeout_secs),
        }
    }

    /// Where a stage's script would be written, for preflight rendering.
    pub fn nominal_script_path(&self, unit: &WorkUnit, stage: &str) -> PathBuf {
        unit.workdir.join(format!("{stage}.{}", self.script_extension))
    }
}

/// Record of one stage applied to one unit.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub termination: Option<Termination>,
    pub line_count: usize,
    pub flagged: Vec<FlaggedLine>,
    pub orphans_terminated: bool,
    pub marker: PathBuf,
    pub log: Option<PathBuf>,
    pub hook: Option<HookOutcome>,
    pub error: Option<String>,
}

impl StageReport {
    /// Report for a stage whose engine was never invoked.
    pub fn not_executed(stage: &str, status: StageStatus, marker: PathBuf) -> Self {
        Self {
            stage: stage.to_string(),
            status,
            started_at: None,
            duration_ms: 0,
            termination: None,
            line_count: 0,
            flagged: Vec::new(),
            orphans_terminated: false,
            marker,
            log: None,
            hook: None,
            error: None,
        }
    }
}

/// Apply `stage` to `unit` unless its marker already exists.
///
/// Returns `Err` only for configuration errors; every other failure is
/// reported as [`StageStatus::HardFailure`].
#[instrument(skip_all, fields(unit = %unit.id, stage = %stage.name))]
pub fn run_stage<E: Engine>(
    engine: &E,
    settings: &StageSettings,
    unit: &WorkUnit,
    stage: &Stage,
) -> Result<StageReport> {
    let marker = marker_path(&unit.workdir, &stage.name);
    if marker.is_file() {
        info!("marker present, skipping");
        return Ok(StageReport::not_executed(
            &stage.name,
            StageStatus::AlreadyDone,
            marker,
        ));
    }

    let start = Instant::now();
    let mut report = StageReport::not_executed(&stage.name, StageStatus::HardFailure, marker);
    report.started_at = Some(Utc::now());
    match execute(engine, settings, unit, stage, &mut report) {
        Ok(()) => {}
        Err(err) if is_config_error(&err) => return Err(err),
        Err(err) => {
            report.status = StageStatus::HardFailure;
            report.error = Some(format!("{err:#}"));
        }
    }
    report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    log_outcome(&report);
    Ok(report)
}

fn execute<E: Engine>(
    engine: &E,
    settings: &StageSettings,
    unit: &WorkUnit,
    stage: &Stage,
    report: &mut StageReport,
) -> Result<()> {
    fs::create_dir_all(&unit.workdir)
        .with_context(|| format!("create working directory {}", unit.workdir.display()))?;

    let vars = TemplateVars::new(&unit.id, &unit.source_dir, &unit.workdir);
    let script_text = stage.template.render(&vars)?;
    let script = write_script(&unit.workdir, &stage.name, &settings.script_extension, &script_text)?;
    let args = render_args(&settings.engine_args, &vars.clone().with_script(&script))?;

    let request = EngineRequest {
        unit: unit.id.clone(),
        stage: stage.name.clone(),
        source_dir: unit.source_dir.clone(),
        workdir: unit.workdir.clone(),
        script_path: script.to_path_buf(),
        args,
    };
    let run = engine.run(&request);
    if let Err(err) = script.close() {
        warn!(err = %err, "remove stage script");
    }
    let run = run?;

    report.termination = Some(run.termination);
    report.line_count = run.lines.len();
    report.flagged = run.flagged.clone();
    report.orphans_terminated = run.orphans_terminated;

    let log_path = engine_log_path(&unit.workdir, &stage.name);
    match write_engine_log(&log_path, &run.lines, run.termination) {
        Ok(()) => report.log = Some(log_path),
        Err(err) => warn!(err = %format!("{err:#}"), "write engine log"),
    }

    let mut status = classify_run(
        run.termination,
        run.has_flagged_lines(),
        settings.success_exit_code,
    );
    if status.writes_marker()
        && let Some(hook) = &stage.post_hook
    {
        let request = HookRequest {
            stage: stage.name.clone(),
            vars,
            workdir: unit.workdir.clone(),
            log_path: hook_log_path(&unit.workdir, &stage.name),
            timeout: settings.hook_timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        };
        let outcome = match hook.run(&request) {
            Ok(outcome) => outcome,
            Err(err) if is_config_error(&err) => return Err(err),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "post-stage hook could not run");
                report.error = Some(format!("post-stage hook: {err:#}"));
                HookOutcome::Failed
            }
        };
        report.hook = Some(outcome);
        if outcome == HookOutcome::Failed {
            status = StageStatus::CompletedWithWarnings;
        }
    }

    report.status = status;
    if status.writes_marker() {
        let exit_code = match run.termination {
            Termination::Exited { code } => code,
            Termination::Forced => None,
        };
        write_marker(
            &report.marker,
            &MarkerRecord {
                stage: stage.name.clone(),
                unit: unit.id.clone(),
                status,
                exit_code,
                finished_at: Utc::now(),
            },
        )?;
    }
    Ok(())
}

/// Write the rendered script to a uniquely named file in `workdir`. The file
/// is deleted when the returned path is dropped.
fn write_script(workdir: &Path, stage: &str, extension: &str, text: &str) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{stage}-"))
        .suffix(&format!(".{extension}"))
        .tempfile_in(workdir)
        .with_context(|| format!("create script file in {}", workdir.display()))?;
    file.write_all(text.as_bytes())
        .and_then(|()| file.flush())
        .context("write stage script")?;
    Ok(file.into_temp_path())
}

fn log_outcome(report: &StageReport) {
    match report.status {
        StageStatus::Succeeded => info!(duration_ms = report.duration_ms, "stage succeeded"),
        StageStatus::CompletedWithWarnings => warn!(
            duration_ms = report.duration_ms,
            flagged = report.flagged.len(),
            hook = ?report.hook,
            "stage completed with warnings"
        ),
        StageStatus::HardFailure => error!(
            duration_ms = report.duration_ms,
            termination = ?report.termination,
            error = report.error.as_deref(),
            "stage failed, marker withheld"
        ),
        StageStatus::AlreadyDone | StageStatus::NotRun => {}
    }
}

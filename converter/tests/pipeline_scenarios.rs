//! Batch-level scenarios driven through a scripted engine.
//!
//! These tests exercise `prepare_batch` + `execute_batch` end to end on a
//! temp directory layout: resume from markers, warning and failure
//! accounting, continuation past failures, preflight aborts, and merging.

use std::fs;

use converter::batch::{BatchOptions, BatchReport, execute_batch, prepare_batch};
use converter::core::types::StageStatus;
use converter::errors::is_config_error;
use converter::io::destination::Destination;
use converter::io::config::{ArtifactConfig, MergeConfig, MergeMode, PipelineConfig};
use converter::io::marker::marker_exists;
use converter::merge::MergeItemStatus;
use converter::test_support::{MemoryDestination, Scripted, ScriptedEngine, TestLayout};

const STAGES: [&str; 4] = ["01-import", "02-clean", "03-build", "04-label"];

fn run(cfg: &PipelineConfig, engine: &ScriptedEngine) -> BatchReport {
    let prepared = prepare_batch(cfg, &BatchOptions::default()).expect("prepare");
    execute_batch(cfg, &prepared, engine, None::<&MemoryDestination>).expect("execute")
}

fn statuses(report: &BatchReport, unit: usize) -> Vec<StageStatus> {
    report.units[unit]
        .stages
        .iter()
        .map(|stage| stage.status)
        .collect()
}

#[test]
fn resume_reruns_only_the_missing_stage() {
    let layout = TestLayout::new(&["A1"]).expect("layout");
    let cfg = layout.config(&["A1"], &STAGES).expect("config");
    let unit = layout.unit("A1");
    fs::create_dir_all(&unit.workdir).expect("mkdir");
    for stage in &STAGES[..3] {
        fs::write(unit.workdir.join(format!("{stage}.done")), "").expect("marker");
    }

    let engine = ScriptedEngine::new();
    let report = run(&cfg, &engine);
    assert!(report.all_clean);
    assert_eq!(
        engine.call_order(),
        [("A1".to_string(), "04-label".to_string())]
    );
    assert_eq!(
        statuses(&report, 0),
        [
            StageStatus::AlreadyDone,
            StageStatus::AlreadyDone,
            StageStatus::AlreadyDone,
            StageStatus::Succeeded
        ]
    );
    assert!(marker_exists(&unit.workdir, "04-label"));

    let again = ScriptedEngine::new();
    let report = run(&cfg, &again);
    assert!(report.all_clean);
    assert!(again.calls().is_empty());
}

#[test]
fn warning_line_keeps_marker_but_clears_all_clean() {
    let layout = TestLayout::new(&["t1-1"]).expect("layout");
    let cfg = layout.config(&["t1-1"], &["01-import"]).expect("config");
    let engine = ScriptedEngine::new();
    engine.push("t1-1", "01-import", Scripted::warning("AML MESSAGE: dangling arc"));

    let report = run(&cfg, &engine);
    assert!(!report.all_clean);
    assert_eq!(statuses(&report, 0), [StageStatus::CompletedWithWarnings]);
    assert_eq!(report.units[0].tally.warnings, 1);
    assert!(marker_exists(&layout.unit("t1-1").workdir, "01-import"));

    let again = ScriptedEngine::new();
    assert!(run(&cfg, &again).all_clean);
    assert!(again.calls().is_empty());
}

#[test]
fn forced_termination_is_retried_on_next_run() {
    let layout = TestLayout::new(&["t1-1"]).expect("layout");
    let cfg = layout.config(&["t1-1"], &["01-import", "02-clean"]).expect("config");
    let engine = ScriptedEngine::new();
    engine.push("t1-1", "02-clean", Scripted::forced());

    let report = run(&cfg, &engine);
    assert!(!report.all_clean);
    assert_eq!(
        statuses(&report, 0),
        [StageStatus::Succeeded, StageStatus::HardFailure]
    );
    assert!(!marker_exists(&layout.unit("t1-1").workdir, "02-clean"));

    let retry = ScriptedEngine::new();
    let report = run(&cfg, &retry);
    assert!(report.all_clean);
    assert_eq!(
        retry.call_order(),
        [("t1-1".to_string(), "02-clean".to_string())]
    );
}

#[test]
fn hard_failure_does_not_block_later_stages_or_units() {
    let layout = TestLayout::new(&["u1", "u2"]).expect("layout");
    let cfg = layout.config(&["u1", "u2"], &["01-import", "02-clean", "03-build"]).expect("config");
    let engine = ScriptedEngine::new();
    engine.push("u1", "02-clean", Scripted::exit(7));

    let report = run(&cfg, &engine);
    assert!(!report.all_clean);
    let order = engine.call_order();
    assert_eq!(order.len(), 6);
    assert_eq!(order[2], ("u1".to_string(), "03-build".to_string()));
    assert_eq!(report.units[0].tally.failures, 1);
    assert_eq!(report.units[0].tally.succeeded, 2);
    assert!(report.units[1].tally.is_clean());
}

#[test]
fn preflight_error_aborts_before_any_engine_call() {
    let layout = TestLayout::new(&["u1", "u2"]).expect("layout");
    layout
        .write_template("02-clean", "clean {{ workdir }} {{ sourcepath }}\n")
        .expect("template");
    let cfg = layout.config(&["u1", "u2"], &["01-import", "02-clean"]).expect("config");

    let err = prepare_batch(&cfg, &BatchOptions::default()).unwrap_err();
    assert!(is_config_error(&err));
    assert!(format!("{err:#}").contains("02-clean"));
    assert!(!layout.path().join("Workfolder").exists());
}

#[test]
fn unknown_unit_selection_is_config_error() {
    let layout = TestLayout::new(&["u1"]).expect("layout");
    let cfg = layout.config(&["u1"], &["01-import"]).expect("config");
    let options = BatchOptions {
        only_units: vec!["u9".into()],
        skip_merge: false,
    };
    assert!(is_config_error(&prepare_batch(&cfg, &options).unwrap_err()));
}

#[test]
fn unit_selection_narrows_the_batch() {
    let layout = TestLayout::new(&["u1", "u2", "u3"]).expect("layout");
    let cfg = layout.config(&["u1", "u2", "u3"], &["01-import"]).expect("config");
    let options = BatchOptions {
        only_units: vec!["u2".into()],
        skip_merge: false,
    };
    let prepared = prepare_batch(&cfg, &options).expect("prepare");
    let engine = ScriptedEngine::new();
    let report =
        execute_batch(&cfg, &prepared, &engine, None::<&MemoryDestination>).expect("execute");
    assert_eq!(report.units.len(), 1);
    assert_eq!(engine.call_order(), [("u2".to_string(), "01-import".to_string())]);
}

fn merge_config() -> MergeConfig {
    MergeConfig {
        destination: "unused".into(),
        template: None,
        remove_unit_artifacts: true,
        artifacts: vec![
            ArtifactConfig {
                path: "out/parcels".into(),
                collection: "parcels".into(),
                mode: MergeMode::Append,
            },
            ArtifactConfig {
                path: "out/anno".into(),
                collection: "annotation/lots".into(),
                mode: MergeMode::Combine,
            },
        ],
    }
}

#[test]
fn merge_runs_after_stages_and_cleans_up() {
    let layout = TestLayout::new(&["t1-1", "t1-2"]).expect("layout");
    let mut cfg = layout.config(&["t1-1", "t1-2"], &["01-import"]).expect("config");
    cfg.merge = Some(merge_config());
    let engine = ScriptedEngine::new();
    for unit in ["t1-1", "t1-2"] {
        engine.push(
            unit,
            "01-import",
            Scripted::clean()
                .creating("out/parcels/arc.adf", unit)
                .creating("out/anno/tx.adf", unit),
        );
    }
    let store = MemoryDestination::new();
    store.fail_merge_for("t1-2");

    let prepared = prepare_batch(&cfg, &BatchOptions::default()).expect("prepare");
    let report = execute_batch(&cfg, &prepared, &engine, Some(&store)).expect("execute");

    let merge = report.merge.as_ref().expect("merge report");
    assert_eq!(merge.failures, 1);
    assert!(!report.all_clean);
    assert_eq!(store.members("parcels"), ["t1-1", "t1-2"]);
    assert_eq!(store.members("annotation/lots"), ["t1-1"]);
    assert!(!store.has_collection("_tmp_annotation_2flots__t1-1"));
    assert!(store.has_collection("_tmp_annotation_2flots__t1-2"));
    assert_eq!(merge.items[3].status, MergeItemStatus::Failed);

    assert!(!layout.unit("t1-1").workdir.join("out/anno").exists());
    assert!(layout.unit("t1-2").workdir.join("out/anno").exists());

    let path = report.report_path.as_ref().expect("report path");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(path).expect("read report")).expect("json");
    assert_eq!(json["all_clean"], false);
    assert_eq!(json["merge"]["failures"], 1);
    assert_eq!(json["units"][0]["stages"][0]["status"], "succeeded");
}

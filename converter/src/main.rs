//! Staged conversion pipeline CLI.
//!
//! Runs the configured stages for every work unit through the external
//! engine, merges unit artifacts into the shared destination, and reports
//! per-unit progress from the on-disk markers.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use converter::batch::{BatchOptions, BatchReport, run_batch};
use converter::core::types::StageStatus;
use converter::exit_codes;
use converter::io::config::load_config;
use converter::io::engine::ExternalEngine;
use converter::io::marker::{marker_path, read_marker};
use converter::io::units::{WorkUnit, enumerate_units};
use converter::logging;

#[derive(Parser)]
#[command(
    name = "converter",
    version,
    about = "Staged conversion pipeline for legacy survey data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every stage for every unit, then merge unit artifacts.
    Run {
        /// Pipeline config file.
        #[arg(short, long, default_value = "conversion.toml")]
        config: PathBuf,
        /// Only process this unit (repeatable).
        #[arg(long = "unit", value_name = "NAME")]
        units: Vec<String>,
        /// Stop after the per-unit stages.
        #[arg(long)]
        skip_merge: bool,
    },
    /// Show which stages each unit has completed.
    Status {
        /// Pipeline config file.
        #[arg(short, long, default_value = "conversion.toml")]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            units,
            skip_merge,
        } => cmd_run(
            &config,
            &BatchOptions {
                only_units: units,
                skip_merge,
            },
        ),
        Command::Status { config } => cmd_status(&config),
    }
}

fn cmd_run(config: &Path, options: &BatchOptions) -> Result<i32> {
    let cfg = load_config(config)?;
    let engine = ExternalEngine::from_config(&cfg)?;
    let report = run_batch(&cfg, &engine, options)?;
    print_summary(&report);
    Ok(if report.all_clean {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn print_summary(report: &BatchReport) {
    for unit in &report.units {
        let t = unit.tally;
        println!(
            "{}: {} succeeded, {} already done, {} warnings, {} failures, {} not run",
            unit.unit, t.succeeded, t.already_done, t.warnings, t.failures, t.not_run
        );
        for stage in &unit.stages {
            if !stage.status.is_clean() {
                println!("  {} {}", stage.stage, stage.status.as_str());
            }
        }
    }
    if let Some(merge) = &report.merge {
        println!("merge: {} items, {} failures", merge.items.len(), merge.failures);
    }
    if let Some(path) = &report.report_path {
        println!("report: {}", path.display());
    }
    println!("{}", if report.all_clean { "all clean" } else { "not clean" });
}

fn cmd_status(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let stage_names: Vec<&str> = cfg.stages.iter().map(|stage| stage.name.as_str()).collect();
    for name in enumerate_units(&cfg.units)? {
        let unit = WorkUnit::new(name, &cfg.units.source_root, &cfg.units.work_root);
        let done = unit.completed_stages(stage_names.iter().copied());
        println!("{}: {}/{} stages done", unit.id, done.len(), stage_names.len());
        for stage in &stage_names {
            let state = if done.contains(stage) {
                match read_marker(&marker_path(&unit.workdir, stage)) {
                    Ok(record) if record.status == StageStatus::CompletedWithWarnings => {
                        "done (warnings)"
                    }
                    _ => "done",
                }
            } else {
                "pending"
            };
            println!("  {stage} {state}");
        }
    }
    Ok(exit_codes::OK)
}

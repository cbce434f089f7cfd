//! Durable run logs: per-stage engine output and the JSON batch report.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::Termination;

pub fn engine_log_path(workdir: &Path, stage: &str) -> PathBuf {
    workdir.join(format!("{stage}.log"))
}

/// `+` is not allowed in stage names, so no stage's engine log can share
/// this path.
pub fn hook_log_path(workdir: &Path, stage: &str) -> PathBuf {
    workdir.join(format!("{stage}+hook.log"))
}

/// Write the captured engine output, overwriting the log of an earlier attempt.
pub fn write_engine_log(path: &Path, lines: &[String], termination: Termination) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for line in lines {
        writeln!(out, "{line}").with_context(|| format!("write {}", path.display()))?;
    }
    let footer = match termination {
        Termination::Exited { code: Some(code) } => format!("[exited with code {code}]"),
        Termination::Exited { code: None } => "[exited by signal]".to_string(),
        Termination::Forced => "[forcibly terminated]".to_string(),
    };
    writeln!(out, "{footer}").with_context(|| format!("write {}", path.display()))?;
    out.flush().with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

/// Serialize `report` to `<dir>/batch-<timestamp>.json` and return the path.
pub fn write_batch_report<T: Serialize>(
    dir: &Path,
    started_at: DateTime<Utc>,
    report: &T,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let stamp = started_at.format("%Y%m%dT%H%M%S%.3fZ");
    let path = dir.join(format!("batch-{stamp}.json"));
    let mut buf = serde_json::to_string_pretty(report).context("serialize batch report")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

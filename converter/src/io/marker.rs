//! Idempotency markers: one file per (stage, unit) in the unit working directory.
//!
//! Only the existence of a marker is interpreted. The JSON content records
//! what happened for people inspecting a half-finished batch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::StageStatus;

pub const MARKER_EXTENSION: &str = "done";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub stage: String,
    pub unit: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

pub fn marker_path(workdir: &Path, stage: &str) -> PathBuf {
    workdir.join(format!("{stage}.{MARKER_EXTENSION}"))
}

pub fn marker_exists(workdir: &Path, stage: &str) -> bool {
    marker_path(workdir, stage).is_file()
}

/// Atomically write a marker (temp file + rename).
pub fn write_marker(path: &Path, record: &MarkerRecord) -> Result<()> {
    debug!(path = %path.display(), status = record.status.as_str(), "writing marker");
    let mut buf = serde_json::to_string_pretty(record).context("serialize marker")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("marker path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("{MARKER_EXTENSION}.tmp"));
    fs::write(&tmp_path, buf).with_context(|| format!("write temp marker {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace marker {}", path.display()))?;
    Ok(())
}

/// Read marker content. Markers written by other tools may be empty, so
/// callers treat a parse failure as "done, details unknown".
pub fn read_marker(path: &Path) -> Result<MarkerRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read marker {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse marker {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MarkerRecord {
        MarkerRecord {
            stage: "03-make-taxlot".into(),
            unit: "t8-9".into(),
            status: StageStatus::CompletedWithWarnings,
            exit_code: Some(0),
            finished_at: DateTime::parse_from_rfc3339("2026-01-18T12:00:00Z")
                .expect("time")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn marker_path_is_derived_from_stage_name() {
        let path = marker_path(Path::new("/w/t8-9"), "03-make-taxlot");
        assert_eq!(path, PathBuf::from("/w/t8-9/03-make-taxlot.done"));
    }

    #[test]
    fn write_creates_marker_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path().join("t8-9");
        let path = marker_path(&workdir, "03-make-taxlot");
        assert!(!marker_exists(&workdir, "03-make-taxlot"));

        write_marker(&path, &record()).expect("write");
        assert!(marker_exists(&workdir, "03-make-taxlot"));
        assert_eq!(read_marker(&path).expect("read"), record());
        let entries: Vec<_> = fs::read_dir(&workdir).expect("dir").collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn empty_marker_still_counts_as_existing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(marker_path(temp.path(), "legacy"), "").expect("write");
        assert!(marker_exists(temp.path(), "legacy"));
        assert!(read_marker(&marker_path(temp.path(), "legacy")).is_err());
    }
}

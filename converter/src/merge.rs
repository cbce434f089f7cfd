//! Merge coordinator: fold per-unit artifacts into the shared destination.
//!
//! Runs strictly after the per-unit stage phase. Each (unit, artifact) pair
//! is merged independently; a failure is recorded and the next pair proceeds.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::io::config::{ArtifactConfig, MergeConfig, MergeMode};
use crate::io::destination::Destination;
use crate::io::fs_tree::remove_path;
use crate::io::units::{WorkUnit, escape_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeItemStatus {
    Appended,
    Combined,
    /// The unit produced no such artifact.
    Missing,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeItemReport {
    pub unit: String,
    pub artifact: PathBuf,
    pub collection: String,
    pub status: MergeItemStatus,
    /// Temporary collection used by a combine; present in the store after a failure.
    pub temporary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub items: Vec<MergeItemReport>,
    pub failures: u32,
}

/// Name of the temporary collection for one unit's combine. Escaped parts
/// never contain `__`, so the separator keeps names of different
/// (collection, unit) pairs apart.
pub fn temporary_collection(collection: &str, unit: &WorkUnit) -> String {
    format!("_tmp_{}__{}", escape_name(collection), unit.tag())
}

#[instrument(skip_all, fields(units = units.len(), artifacts = cfg.artifacts.len()))]
pub fn merge_units<D: Destination>(
    destination: &D,
    units: &[WorkUnit],
    cfg: &MergeConfig,
) -> MergeReport {
    let mut report = MergeReport::default();
    for unit in units {
        for artifact in &cfg.artifacts {
            let item = merge_item(destination, unit, artifact, cfg.remove_unit_artifacts);
            if item.status == MergeItemStatus::Failed {
                report.failures += 1;
            }
            report.items.push(item);
        }
    }
    if report.failures == 0 {
        info!(items = report.items.len(), "merge finished");
    } else {
        warn!(failures = report.failures, "merge finished with failures");
    }
    report
}

fn merge_item<D: Destination>(
    destination: &D,
    unit: &WorkUnit,
    artifact: &ArtifactConfig,
    remove_unit_artifact: bool,
) -> MergeItemReport {
    let path = unit.workdir.join(&artifact.path);
    let mut item = MergeItemReport {
        unit: unit.id.clone(),
        artifact: path.clone(),
        collection: artifact.collection.clone(),
        status: MergeItemStatus::Failed,
        temporary: None,
        error: None,
    };
    if !path.exists() {
        warn!(unit = %unit.id, artifact = %path.display(), "artifact missing, skipping");
        item.status = MergeItemStatus::Missing;
        return item;
    }

    let merged = match artifact.mode {
        MergeMode::Append => destination
            .append(&path, &artifact.collection, &unit.tag())
            .map(|()| MergeItemStatus::Appended),
        MergeMode::Combine => {
            let temporary = temporary_collection(&artifact.collection, unit);
            item.temporary = Some(temporary.clone());
            combine(destination, unit, &path, &temporary, &artifact.collection)
                .map(|()| MergeItemStatus::Combined)
        }
    };

    match merged {
        Ok(status) => {
            info!(unit = %unit.id, collection = %artifact.collection, "merged artifact");
            item.status = status;
            item.temporary = None;
            if remove_unit_artifact && let Err(err) = remove_path(&path) {
                warn!(artifact = %path.display(), err = %format!("{err:#}"), "remove unit artifact");
            }
        }
        Err(err) => {
            warn!(
                unit = %unit.id,
                collection = %artifact.collection,
                temporary = item.temporary.as_deref(),
                err = %format!("{err:#}"),
                "merge failed"
            );
            item.error = Some(format!("{err:#}"));
        }
    }
    item
}

fn combine<D: Destination>(
    destination: &D,
    unit: &WorkUnit,
    artifact: &Path,
    temporary: &str,
    canonical: &str,
) -> Result<()> {
    destination.copy_to_temporary(artifact, temporary)?;
    destination.merge_into(temporary, canonical, &unit.tag())?;
    destination.delete_collection(temporary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::destination::DirectoryStore;
    use crate::test_support::MemoryDestination;
    use std::fs;

    fn unit(root: &Path, id: &str, artifacts: &[&str]) -> WorkUnit {
        let unit = WorkUnit::new(id, &root.join("Source"), &root.join("Workfolder"));
        for artifact in artifacts {
            let path = unit.workdir.join(artifact);
            fs::create_dir_all(&path).expect("mkdir");
            fs::write(path.join("data"), id).expect("write");
        }
        unit
    }

    fn cfg(remove: bool) -> MergeConfig {
        MergeConfig {
            destination: PathBuf::from("unused"),
            template: None,
            remove_unit_artifacts: remove,
            artifacts: vec![
                ArtifactConfig {
                    path: PathBuf::from("lines"),
                    collection: "parcels/lines".into(),
                    mode: MergeMode::Append,
                },
                ArtifactConfig {
                    path: PathBuf::from("anno"),
                    collection: "anno".into(),
                    mode: MergeMode::Combine,
                },
            ],
        }
    }

    #[test]
    fn combine_failure_leaves_temporary_and_other_units_proceed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let units = vec![
            unit(temp.path(), "t1-1", &["lines", "anno"]),
            unit(temp.path(), "t1-2", &["lines", "anno"]),
        ];
        let store = MemoryDestination::new();
        store.fail_merge_for("t1-1");

        let report = merge_units(&store, &units, &cfg(true));
        assert_eq!(report.failures, 1);
        let failed = &report.items[1];
        assert_eq!(failed.status, MergeItemStatus::Failed);
        assert_eq!(failed.temporary.as_deref(), Some("_tmp_anno__t1-1"));
        assert!(store.has_collection("_tmp_anno__t1-1"));
        assert!(units[0].workdir.join("anno").exists());

        assert_eq!(report.items[3].status, MergeItemStatus::Combined);
        assert!(!store.has_collection("_tmp_anno__t1-2"));
        assert!(!units[1].workdir.join("anno").exists());
        assert_eq!(store.members("anno"), ["t1-2"]);
        assert_eq!(store.members("parcels/lines"), ["t1-1", "t1-2"]);
    }

    #[test]
    fn append_failure_is_counted_and_other_units_still_merge() {
        let temp = tempfile::tempdir().expect("tempdir");
        let units = vec![
            unit(temp.path(), "t3-1", &["lines", "anno"]),
            unit(temp.path(), "t3-2", &["lines", "anno"]),
        ];
        let store = MemoryDestination::new();
        store.fail_append_for("t3-1");

        let report = merge_units(&store, &units, &cfg(true));
        assert_eq!(report.failures, 1);
        assert_eq!(report.items[0].status, MergeItemStatus::Failed);
        assert!(report.items[0].error.as_deref().unwrap_or_default().contains("t3-1"));
        assert!(units[0].workdir.join("lines").exists());

        assert_eq!(report.items[1].status, MergeItemStatus::Combined);
        assert_eq!(report.items[2].status, MergeItemStatus::Appended);
        assert_eq!(store.members("parcels/lines"), ["t3-2"]);
        assert_eq!(store.members("anno"), ["t3-1", "t3-2"]);
    }

    #[test]
    fn units_with_similar_ids_do_not_overwrite_each_other() {
        let temp = tempfile::tempdir().expect("tempdir");
        let units = vec![
            unit(temp.path(), "t8-9", &["lines", "anno"]),
            unit(temp.path(), "t8_9", &["lines", "anno"]),
        ];
        let store = DirectoryStore::open_or_create(&temp.path().join("store"), None)
            .expect("open store");

        let report = merge_units(&store, &units, &cfg(false));
        assert_eq!(report.failures, 0);
        for collection in ["parcels/lines", "anno"] {
            let dir = collection
                .split('/')
                .fold(store.root().to_path_buf(), |path, part| path.join(part));
            for (tag, id) in [("t8-9", "t8-9"), ("t8_5f9", "t8_9")] {
                let data = fs::read_to_string(dir.join(tag).join("data")).expect("read member");
                assert_eq!(data, id);
            }
        }
    }

    #[test]
    fn missing_artifacts_are_skipped_without_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let units = vec![unit(temp.path(), "t2-1", &["lines"])];
        let store = MemoryDestination::new();

        let report = merge_units(&store, &units, &cfg(false));
        assert_eq!(report.failures, 0);
        assert_eq!(report.items[1].status, MergeItemStatus::Missing);
        assert!(units[0].workdir.join("lines").exists());
    }
}

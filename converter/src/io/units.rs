//! Work unit discovery and source staging.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::io::config::UnitsConfig;
use crate::io::fs_tree::{copy_tree, remove_path};
use crate::io::marker::marker_exists;

/// One independently processed geographic tile: source input plus a private
/// working directory for its stage outputs and markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub id: String,
    pub source_dir: PathBuf,
    pub workdir: PathBuf,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, source_root: &Path, work_root: &Path) -> Self {
        let id = id.into();
        Self {
            source_dir: source_root.join(&id),
            workdir: work_root.join(&id),
            id,
        }
    }

    /// Identifier safe to embed in destination collection names. Distinct
    /// ids always give distinct tags.
    pub fn tag(&self) -> String {
        escape_name(&self.id)
    }

    /// Names from `stages` whose marker is present, in the given order.
    pub fn completed_stages<'a, I>(&self, stages: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        stages
            .into_iter()
            .filter(|stage| marker_exists(&self.workdir, stage))
            .collect()
    }
}

/// Reversible escape for names embedded in collection names: ASCII
/// alphanumerics and `-` pass through, every other byte becomes `_xx` (lower
/// hex). The output never contains `__`.
pub fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("_{byte:02x}"));
        }
    }
    escaped
}

/// Unit names selected by the config, without touching the filesystem
/// beyond listing the enumeration root.
pub fn enumerate_units(cfg: &UnitsConfig) -> Result<Vec<String>> {
    let Some(pattern) = &cfg.pattern else {
        return Ok(cfg.names.clone());
    };
    let root = cfg.archive.as_deref().unwrap_or(&cfg.source_root);
    let names = list_matching(root, pattern)?;
    if names.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "units.pattern {pattern:?} matched no directory under {}",
            root.display()
        ))
        .into());
    }
    Ok(names)
}

/// Subdirectory names of `root` matching the glob `pattern`, sorted.
pub fn list_matching(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let glob = glob::Pattern::new(pattern).map_err(|err| ConfigError::UnitPattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })?;
    let entries = fs::read_dir(root).map_err(|err| {
        ConfigError::Invalid(format!("read unit root {}: {err}", root.display()))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if glob.matches(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Resolve the configured units, staging sources from the archive when one
/// is configured. Every returned unit has an existing source directory.
pub fn resolve_units(cfg: &UnitsConfig) -> Result<Vec<WorkUnit>> {
    let names = enumerate_units(cfg)?;
    let mut units = Vec::with_capacity(names.len());
    for name in names {
        let unit = WorkUnit::new(name, &cfg.source_root, &cfg.work_root);
        if let Some(archive) = &cfg.archive {
            let staged = archive.join(&unit.id);
            if !staged.is_dir() {
                return Err(ConfigError::MissingSource {
                    unit: unit.id,
                    path: staged,
                }
                .into());
            }
            stage_source(&staged, &unit.source_dir)?;
        }
        if !unit.source_dir.is_dir() {
            return Err(ConfigError::MissingSource {
                unit: unit.id.clone(),
                path: unit.source_dir.clone(),
            }
            .into());
        }
        units.push(unit);
    }
    debug!(count = units.len(), "resolved work units");
    Ok(units)
}

/// Copy an archived unit source into place. An existing target is kept as is.
/// Returns whether a copy was made.
pub fn stage_source(from: &Path, to: &Path) -> Result<bool> {
    if to.exists() {
        debug!(target = %to.display(), "unit source already staged");
        return Ok(false);
    }
    let file_name = to
        .file_name()
        .with_context(|| format!("staging target has no name: {}", to.display()))?;
    let mut partial_name = file_name.to_os_string();
    partial_name.push(".partial");
    let partial = to.with_file_name(partial_name);
    remove_path(&partial)?;

    info!(from = %from.display(), to = %to.display(), "staging unit source");
    copy_tree(from, &partial)?;
    fs::rename(&partial, to)
        .with_context(|| format!("move {} -> {}", partial.display(), to.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_config_error;

    fn units_cfg(root: &Path) -> UnitsConfig {
        UnitsConfig {
            source_root: root.join("Source"),
            work_root: root.join("Workfolder"),
            pattern: None,
            names: Vec::new(),
            archive: None,
        }
    }

    fn mkdirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir_all(root.join(name)).expect("mkdir");
        }
    }

    #[test]
    fn pattern_selects_sorted_directories_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = units_cfg(temp.path());
        mkdirs(&cfg.source_root, &["t9-9", "t4-1", "t8-9", "r1-1"]);
        fs::write(cfg.source_root.join("t5-5"), "not a dir").expect("write");
        cfg.pattern = Some("t[4-9]-*".into());

        let units = resolve_units(&cfg).expect("resolve");
        let ids: Vec<_> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["t4-1", "t8-9", "t9-9"]);
        assert_eq!(units[1].workdir, cfg.work_root.join("t8-9"));
    }

    #[test]
    fn explicit_names_keep_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = units_cfg(temp.path());
        mkdirs(&cfg.source_root, &["b", "a"]);
        cfg.names = vec!["b".into(), "a".into()];
        let ids: Vec<_> = resolve_units(&cfg)
            .expect("resolve")
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn missing_source_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = units_cfg(temp.path());
        mkdirs(&cfg.source_root, &["a"]);
        cfg.names = vec!["a".into(), "ghost".into()];
        let err = resolve_units(&cfg).unwrap_err();
        assert!(is_config_error(&err));
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[test]
    fn bad_pattern_and_empty_match_are_config_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = units_cfg(temp.path());
        mkdirs(&cfg.source_root, &["a"]);

        cfg.pattern = Some("t[".into());
        assert!(is_config_error(&resolve_units(&cfg).unwrap_err()));

        cfg.pattern = Some("zz*".into());
        assert!(is_config_error(&resolve_units(&cfg).unwrap_err()));
    }

    #[test]
    fn archive_staging_copies_once_and_never_overwrites() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = units_cfg(temp.path());
        let archive = temp.path().join("archive");
        mkdirs(&archive, &["t1-1/cov"]);
        fs::write(archive.join("t1-1/cov/arc.adf"), "archived").expect("write");
        cfg.archive = Some(archive.clone());
        cfg.pattern = Some("t*".into());

        let units = resolve_units(&cfg).expect("resolve");
        let staged = units[0].source_dir.join("cov/arc.adf");
        assert_eq!(fs::read_to_string(&staged).expect("read"), "archived");

        fs::write(&staged, "edited").expect("write");
        resolve_units(&cfg).expect("resolve again");
        assert_eq!(fs::read_to_string(&staged).expect("read"), "edited");
        assert!(!cfg.source_root.join("t1-1.partial").exists());
    }

    #[test]
    fn completed_stages_follow_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unit = WorkUnit::new("t8-9", &temp.path().join("S"), &temp.path().join("W"));
        fs::create_dir_all(&unit.workdir).expect("mkdir");
        fs::write(unit.workdir.join("01-a.done"), "").expect("write");
        fs::write(unit.workdir.join("03-c.done"), "").expect("write");

        let done = unit.completed_stages(["01-a", "02-b", "03-c"]);
        assert_eq!(done, ["01-a", "03-c"]);
    }

    #[test]
    fn tag_escapes_everything_but_alphanumerics_and_dashes() {
        let unit = WorkUnit::new("t8-9.v2", Path::new("S"), Path::new("W"));
        assert_eq!(unit.tag(), "t8-9_2ev2");
        assert_eq!(escape_name("a/b c"), "a_2fb_20c");
    }

    #[test]
    fn similar_ids_keep_distinct_tags() {
        let tags: Vec<String> = ["t8-9", "t8_9", "t8.9", "t8_2d9"]
            .iter()
            .map(|id| WorkUnit::new(*id, Path::new("S"), Path::new("W")).tag())
            .collect();
        assert_eq!(tags, ["t8-9", "t8_5f9", "t8_2e9", "t8_5f2d9"]);
    }
}

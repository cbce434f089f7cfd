//! Pipeline configuration loaded from a TOML file.
//!
//! The config is the single source of stage lists, path roots and supervisor
//! tuning; it is passed explicitly into the batch run. Relative paths inside
//! the file are resolved against the directory that contains it.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::countdown::GracePolicy;
use crate::core::sentinel::Sentinels;
use crate::errors::ConfigError;

/// Top-level pipeline configuration (TOML).
///
/// Missing optional fields default to the values used with the legacy
/// coverage engine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
    pub units: UnitsConfig,

    /// Keep running later stages of a unit after one of its stages hard-fails.
    pub continue_on_failure: bool,

    /// Wall-clock limit for a single post-stage hook command.
    pub hook_timeout_secs: u64,

    pub stages: Vec<StageConfig>,
    pub merge: Option<MergeConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            supervisor: SupervisorConfig::default(),
            units: UnitsConfig::default(),
            continue_on_failure: true,
            hook_timeout_secs: 600,
            stages: Vec::new(),
            merge: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable; bare names are looked up on `PATH`.
    pub executable: String,
    /// Argument templates. Placeholders: `source`, `workdir`, `unit`, `script`.
    pub args: Vec<String>,
    /// Extension of the generated script file.
    pub script_extension: String,
    /// Exit code the engine reports on success.
    pub success_exit_code: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: "arc".to_string(),
            args: vec!["&r {{ script }}".to_string(), "{{ source }}".to_string()],
            script_extension: "aml".to_string(),
            success_exit_code: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_ms: u64,
    pub liveness_ticks: u32,
    pub error_grace_ticks: u32,
    pub abort_grace_ticks: u32,
    pub prompt_grace_ticks: u32,
    /// Capacity of the line queue between the reader thread and the supervisor loop.
    pub queue_capacity: usize,
    pub error_pattern: String,
    pub abort_pattern: String,
    pub prompt_pattern: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let grace = GracePolicy::default();
        Self {
            tick_ms: 1000,
            liveness_ticks: grace.liveness_ticks,
            error_grace_ticks: grace.error_grace_ticks,
            abort_grace_ticks: grace.abort_grace_ticks,
            prompt_grace_ticks: grace.prompt_grace_ticks,
            queue_capacity: 1024,
            error_pattern: "AML MESSAGE".to_string(),
            abort_pattern: "Stopping execution".to_string(),
            prompt_pattern: r"DO YOU WANT TO TRY AGAIN\?".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn grace_policy(&self) -> GracePolicy {
        GracePolicy {
            liveness_ticks: self.liveness_ticks,
            error_grace_ticks: self.error_grace_ticks,
            abort_grace_ticks: self.abort_grace_ticks,
            prompt_grace_ticks: self.prompt_grace_ticks,
        }
    }

    pub fn sentinels(&self) -> Result<Sentinels, ConfigError> {
        Sentinels::new(&self.error_pattern, &self.abort_pattern, &self.prompt_pattern)
            .map_err(|err| ConfigError::Invalid(format!("supervisor sentinel pattern: {err}")))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UnitsConfig {
    /// Directory holding one source subdirectory per unit.
    pub source_root: PathBuf,
    /// Directory holding one working subdirectory per unit.
    pub work_root: PathBuf,
    /// Glob over unit directory names, e.g. `t[4-9]-*`.
    pub pattern: Option<String>,
    /// Explicit unit names, used instead of `pattern`.
    pub names: Vec<String>,
    /// When set, units are enumerated here and staged into `source_root`.
    pub archive: Option<PathBuf>,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("Source"),
            work_root: PathBuf::from("Workfolder"),
            pattern: None,
            names: Vec::new(),
            archive: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    pub template: PathBuf,
    /// Command run after the stage completes; each element is a template.
    #[serde(default)]
    pub post_hook: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MergeConfig {
    pub destination: PathBuf,
    /// Store copied into place when `destination` does not exist yet.
    #[serde(default)]
    pub template: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub remove_unit_artifacts: bool,
    #[serde(default)]
    pub artifacts: Vec<ArtifactConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ArtifactConfig {
    /// Artifact location relative to a unit's working directory.
    pub path: PathBuf,
    /// Destination collection name (`/` separates nested collections).
    pub collection: String,
    #[serde(default)]
    pub mode: MergeMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Append the unit artifact straight into the collection.
    #[default]
    Append,
    /// Copy into a temporary collection, merge into the canonical one, delete the temporary.
    Combine,
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.engine.executable.trim().is_empty() {
            return invalid("engine.executable must not be empty".into());
        }
        if self.engine.script_extension.contains(['/', '\\', '.']) {
            return invalid("engine.script_extension must be a bare extension".into());
        }
        if ["done", "log"].contains(&self.engine.script_extension.as_str()) {
            return invalid(format!(
                "engine.script_extension {:?} would overwrite stage markers or logs",
                self.engine.script_extension
            ));
        }

        let sup = &self.supervisor;
        if sup.tick_ms == 0 {
            return invalid("supervisor.tick_ms must be > 0".into());
        }
        if sup.liveness_ticks == 0 {
            return invalid("supervisor.liveness_ticks must be > 0".into());
        }
        for (field, value) in [
            ("error_grace_ticks", sup.error_grace_ticks),
            ("abort_grace_ticks", sup.abort_grace_ticks),
            ("prompt_grace_ticks", sup.prompt_grace_ticks),
        ] {
            if value == 0 || value > sup.liveness_ticks {
                return invalid(format!(
                    "supervisor.{field} must be in 1..={}",
                    sup.liveness_ticks
                ));
            }
        }
        if sup.queue_capacity == 0 {
            return invalid("supervisor.queue_capacity must be > 0".into());
        }
        sup.sentinels()?;

        match (&self.units.pattern, self.units.names.is_empty()) {
            (Some(_), false) => {
                return invalid("units.pattern and units.names are mutually exclusive".into());
            }
            (None, true) => return invalid("one of units.pattern or units.names is required".into()),
            _ => {}
        }
        let mut seen = BTreeSet::new();
        for name in &self.units.names {
            if !is_safe_name(name) {
                return invalid(format!("units.names: invalid unit name {name:?}"));
            }
            if !seen.insert(name.as_str()) {
                return invalid(format!("units.names: duplicate unit {name:?}"));
            }
        }

        if self.hook_timeout_secs == 0 {
            return invalid("hook_timeout_secs must be > 0".into());
        }

        if self.stages.is_empty() {
            return invalid("at least one [[stages]] entry is required".into());
        }
        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            if !is_safe_name(&stage.name) {
                return invalid(format!(
                    "stage name {:?} must be non-empty and use only [A-Za-z0-9._-]",
                    stage.name
                ));
            }
            if !seen.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage name {:?}", stage.name));
            }
            if stage.post_hook.first().is_some_and(|cmd| cmd.trim().is_empty()) {
                return invalid(format!("stage {:?}: post_hook command is empty", stage.name));
            }
        }

        if let Some(merge) = &self.merge {
            for artifact in &merge.artifacts {
                if !is_relative_inside(&artifact.path) {
                    return invalid(format!(
                        "merge artifact path {} must be relative to the unit working directory",
                        artifact.path.display()
                    ));
                }
                if !is_collection_name(&artifact.collection) {
                    return invalid(format!(
                        "merge artifact collection {:?} is not a valid collection name",
                        artifact.collection
                    ));
                }
            }
        }

        Ok(())
    }

    /// Rewrite relative paths so they are anchored at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        anchor(&mut self.units.source_root);
        anchor(&mut self.units.work_root);
        if let Some(archive) = &mut self.units.archive {
            anchor(archive);
        }
        for stage in &mut self.stages {
            anchor(&mut stage.template);
        }
        if let Some(merge) = &mut self.merge {
            anchor(&mut merge.destination);
            if let Some(template) = &mut merge.template {
                anchor(template);
            }
        }
        let executable = Path::new(&self.engine.executable);
        if executable.is_relative() && executable.components().count() > 1 {
            self.engine.executable = base.join(executable).display().to_string();
        }
    }

    /// Directory where batch reports are written.
    pub fn reports_dir(&self) -> PathBuf {
        self.units.work_root.join("reports")
    }
}

/// Load, resolve and validate a pipeline config.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: PipelineConfig = toml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("parse {}: {err}", path.display())))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    cfg.resolve_paths(base);
    cfg.validate()?;
    Ok(cfg)
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn is_relative_inside(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn is_collection_name(name: &str) -> bool {
    !name.is_empty() && name.split('/').all(is_safe_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [units]
        pattern = "t[4-9]-*"

        [[stages]]
        name = "01-make-map-index"
        template = "aml/01-MakeMapIndex.aml"
    "#;

    fn parse(raw: &str) -> PipelineConfig {
        toml::from_str(raw).expect("parse")
    }

    #[test]
    fn minimal_config_uses_legacy_defaults() {
        let cfg = parse(MINIMAL);
        cfg.validate().expect("valid");
        assert_eq!(cfg.engine.executable, "arc");
        assert_eq!(cfg.supervisor.liveness_ticks, 60);
        assert!(cfg.continue_on_failure);
        assert_eq!(cfg.stages.len(), 1);
        assert!(cfg.merge.is_none());
    }

    #[test]
    fn load_resolves_relative_paths_against_config_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("conversion.toml");
        fs::write(&path, MINIMAL).expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.units.source_root, temp.path().join("Source"));
        assert_eq!(cfg.units.work_root, temp.path().join("Workfolder"));
        assert_eq!(
            cfg.stages[0].template,
            temp.path().join("aml/01-MakeMapIndex.aml")
        );
        assert_eq!(cfg.engine.executable, "arc");
    }

    #[test]
    fn relative_executable_with_directory_is_resolved() {
        let mut cfg = parse(MINIMAL);
        cfg.engine.executable = "bin/arc".into();
        cfg.resolve_paths(Path::new("/srv/convert"));
        assert_eq!(cfg.engine.executable, "/srv/convert/bin/arc");
    }

    #[test]
    fn rejects_duplicate_stage_names() {
        let mut cfg = parse(MINIMAL);
        cfg.stages.push(cfg.stages[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn rejects_stage_names_unusable_as_marker_files() {
        let mut cfg = parse(MINIMAL);
        cfg.stages[0].name = "../escape".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_script_extensions_shared_with_markers_and_logs() {
        let mut cfg = parse(MINIMAL);
        cfg.engine.script_extension = "done".into();
        assert!(cfg.validate().unwrap_err().to_string().contains("markers or logs"));
        cfg.engine.script_extension = "log".into();
        assert!(cfg.validate().is_err());
        cfg.engine.script_extension = "aml".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn requires_exactly_one_unit_selector() {
        let mut cfg = parse(MINIMAL);
        cfg.units.names = vec!["t8-9".into()];
        assert!(cfg.validate().unwrap_err().to_string().contains("mutually exclusive"));

        cfg.units.pattern = None;
        cfg.units.names.clear();
        assert!(cfg.validate().unwrap_err().to_string().contains("required"));
    }

    #[test]
    fn rejects_grace_longer_than_liveness() {
        let mut cfg = parse(MINIMAL);
        cfg.supervisor.prompt_grace_ticks = 61;
        assert!(cfg.validate().unwrap_err().to_string().contains("prompt_grace_ticks"));
    }

    #[test]
    fn rejects_bad_sentinel_pattern() {
        let mut cfg = parse(MINIMAL);
        cfg.supervisor.error_pattern = "(".into();
        assert!(cfg.validate().unwrap_err().to_string().contains("sentinel"));
    }

    #[test]
    fn parses_merge_section() {
        let cfg = parse(&format!(
            r#"{MINIMAL}
            [merge]
            destination = "Workfolder/ORMAP.gdb"

            [[merge.artifacts]]
            path = "tmptaxlot/arc"
            collection = "taxlots_fd/taxlot_lines"

            [[merge.artifacts]]
            path = "anno/taxlot"
            collection = "taxlot_anno"
            mode = "combine"
            "#
        ));
        cfg.validate().expect("valid");
        let merge = cfg.merge.expect("merge");
        assert!(merge.remove_unit_artifacts);
        assert_eq!(merge.artifacts[0].mode, MergeMode::Append);
        assert_eq!(merge.artifacts[1].mode, MergeMode::Combine);
    }

    #[test]
    fn rejects_artifact_paths_escaping_workdir() {
        let mut cfg = parse(MINIMAL);
        cfg.merge = Some(MergeConfig {
            destination: "out".into(),
            template: None,
            remove_unit_artifacts: true,
            artifacts: vec![ArtifactConfig {
                path: "../other/arc".into(),
                collection: "lines".into(),
                mode: MergeMode::Append,
            }],
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_errors_are_config_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("conversion.toml");
        fs::write(&path, "stages = 3").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(crate::errors::is_config_error(&err));
    }
}

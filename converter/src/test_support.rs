//! Test doubles for the engine and destination, plus process helpers.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{LineSignal, Termination};
use crate::errors::ConfigError;
use crate::io::config::{PipelineConfig, StageConfig, UnitsConfig};
use crate::io::destination::Destination;
use crate::io::engine::{Engine, EngineRequest};
use crate::io::supervisor::{FlaggedLine, SupervisedRun};
use crate::io::units::WorkUnit;

enum ScriptedResult {
    Run(SupervisedRun),
    Fail(String),
    MissingEngine,
}

/// Canned result for one engine invocation.
pub struct Scripted {
    result: ScriptedResult,
    files: Vec<(PathBuf, String)>,
}

impl Scripted {
    fn run(termination: Termination, lines: &[&str], flagged: Vec<FlaggedLine>) -> Self {
        Self {
            result: ScriptedResult::Run(SupervisedRun {
                termination,
                lines: lines.iter().map(|line| (*line).to_string()).collect(),
                flagged,
                orphans_terminated: false,
            }),
            files: Vec::new(),
        }
    }

    /// Exit 0 after printing `lines`, none flagged.
    pub fn lines(lines: &[&str]) -> Self {
        Self::run(Termination::Exited { code: Some(0) }, lines, Vec::new())
    }

    pub fn clean() -> Self {
        Self::lines(&["done"])
    }

    /// Exit 0 after printing one error-marker line.
    pub fn warning(line: &str) -> Self {
        let flagged = vec![FlaggedLine {
            signal: LineSignal::Error,
            line: line.to_string(),
        }];
        Self::run(Termination::Exited { code: Some(0) }, &[line], flagged)
    }

    pub fn forced() -> Self {
        Self::run(Termination::Forced, &[], Vec::new())
    }

    pub fn exit(code: i32) -> Self {
        Self::run(Termination::Exited { code: Some(code) }, &[], Vec::new())
    }

    /// The engine could not be watched (non-fatal).
    pub fn error(message: &str) -> Self {
        Self {
            result: ScriptedResult::Fail(message.to_string()),
            files: Vec::new(),
        }
    }

    /// The engine executable does not exist (fatal).
    pub fn missing_engine() -> Self {
        Self {
            result: ScriptedResult::MissingEngine,
            files: Vec::new(),
        }
    }

    /// Also create `relative` (inside the unit workdir) with `contents`.
    pub fn creating(mut self, relative: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.push((relative.into(), contents.to_string()));
        self
    }
}

/// One recorded engine invocation.
#[derive(Debug, Clone)]
pub struct EngineCall {
    pub unit: String,
    pub stage: String,
    pub args: Vec<String>,
    /// Script contents at invocation time.
    pub script: String,
    pub script_path: PathBuf,
}

/// Engine that records invocations and replays queued results.
///
/// Invocations without a queued result exit cleanly.
#[derive(Default)]
pub struct ScriptedEngine {
    queued: RefCell<HashMap<(String, String), VecDeque<Scripted>>>,
    calls: RefCell<Vec<EngineCall>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, unit: &str, stage: &str, scripted: Scripted) {
        self.queued
            .borrow_mut()
            .entry((unit.to_string(), stage.to_string()))
            .or_default()
            .push_back(scripted);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.borrow().clone()
    }

    pub fn call_order(&self) -> Vec<(String, String)> {
        self.calls
            .borrow()
            .iter()
            .map(|call| (call.unit.clone(), call.stage.clone()))
            .collect()
    }
}

impl Engine for ScriptedEngine {
    fn run(&self, request: &EngineRequest) -> Result<SupervisedRun> {
        let script = fs::read_to_string(&request.script_path)
            .map_err(|err| anyhow!("script {} unreadable: {err}", request.script_path.display()))?;
        self.calls.borrow_mut().push(EngineCall {
            unit: request.unit.clone(),
            stage: request.stage.clone(),
            args: request.args.clone(),
            script,
            script_path: request.script_path.clone(),
        });
        let scripted = self
            .queued
            .borrow_mut()
            .get_mut(&(request.unit.clone(), request.stage.clone()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Scripted::clean);
        for (relative, contents) in &scripted.files {
            let path = request.workdir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        match scripted.result {
            ScriptedResult::Run(run) => Ok(run),
            ScriptedResult::Fail(message) => Err(anyhow!(message)),
            ScriptedResult::MissingEngine => Err(ConfigError::MissingEngine("scripted".into()).into()),
        }
    }
}

/// In-memory destination: collection name to member tags.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    collections: RefCell<BTreeMap<String, BTreeSet<String>>>,
    fail_append: RefCell<BTreeSet<String>>,
    fail_merge: RefCell<BTreeSet<String>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_append_for(&self, unit_tag: &str) {
        self.fail_append.borrow_mut().insert(unit_tag.to_string());
    }

    pub fn fail_merge_for(&self, unit_tag: &str) {
        self.fail_merge.borrow_mut().insert(unit_tag.to_string());
    }

    /// Sorted members of a collection; empty when it does not exist.
    pub fn members(&self, collection: &str) -> Vec<String> {
        self.collections
            .borrow()
            .get(collection)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Destination for MemoryDestination {
    fn append(&self, artifact: &Path, collection: &str, unit_tag: &str) -> Result<()> {
        if self.fail_append.borrow().contains(unit_tag) {
            bail!("injected append failure for {unit_tag}");
        }
        if !artifact.exists() {
            bail!("artifact {} does not exist", artifact.display());
        }
        self.collections
            .borrow_mut()
            .entry(collection.to_string())
            .or_default()
            .insert(unit_tag.to_string());
        Ok(())
    }

    fn copy_to_temporary(&self, artifact: &Path, temporary: &str) -> Result<()> {
        let name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.collections
            .borrow_mut()
            .insert(temporary.to_string(), BTreeSet::from([name]));
        Ok(())
    }

    fn merge_into(&self, temporary: &str, canonical: &str, unit_tag: &str) -> Result<()> {
        if self.fail_merge.borrow().contains(unit_tag) {
            bail!("injected merge failure for {unit_tag}");
        }
        let mut collections = self.collections.borrow_mut();
        if !collections.contains_key(temporary) {
            bail!("temporary collection {temporary} does not exist");
        }
        collections
            .entry(canonical.to_string())
            .or_default()
            .insert(unit_tag.to_string());
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.borrow_mut().remove(name);
        Ok(())
    }

    fn has_collection(&self, name: &str) -> bool {
        self.collections.borrow().contains_key(name)
    }
}

/// Temporary batch layout: `Source/<unit>` directories, stage templates and
/// a matching config rooted in a temp dir.
pub struct TestLayout {
    dir: TempDir,
}

impl TestLayout {
    pub fn new(units: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        for unit in units {
            fs::create_dir_all(dir.path().join("Source").join(unit))
                .with_context(|| format!("create source for {unit}"))?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_template(&self, stage: &str, body: &str) -> Result<PathBuf> {
        let path = self.path().join("templates").join(format!("{stage}.tpl"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Config with explicit unit names and one stage per name. Stages whose
    /// template file does not exist yet get `process {{ source }}`.
    pub fn config(&self, units: &[&str], stages: &[&str]) -> Result<PipelineConfig> {
        let mut stage_cfgs = Vec::with_capacity(stages.len());
        for stage in stages {
            let path = self.path().join("templates").join(format!("{stage}.tpl"));
            let template = if path.exists() {
                path
            } else {
                self.write_template(stage, "process {{ source }}\n")?
            };
            stage_cfgs.push(StageConfig {
                name: (*stage).to_string(),
                template,
                post_hook: Vec::new(),
            });
        }
        Ok(PipelineConfig {
            units: UnitsConfig {
                source_root: self.path().join("Source"),
                work_root: self.path().join("Workfolder"),
                pattern: None,
                names: units.iter().map(|unit| (*unit).to_string()).collect(),
                archive: None,
            },
            stages: stage_cfgs,
            ..PipelineConfig::default()
        })
    }

    pub fn unit(&self, id: &str) -> WorkUnit {
        WorkUnit::new(id, &self.path().join("Source"), &self.path().join("Workfolder"))
    }
}

/// Whether `pid` names a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    !matches!(state, None | Some('Z' | 'X'))
}

/// Wait until `path` holds a complete line and return its contents.
pub fn wait_for_file(path: &Path, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(contents) = fs::read_to_string(path)
            && contents.ends_with('\n')
        {
            return contents;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

//! Engine abstraction for stage execution.
//!
//! The [`Engine`] trait decouples the stage runner from the actual legacy
//! batch engine. Tests use scripted engines that return predetermined runs
//! without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use tracing::info;

use crate::errors::ConfigError;
use crate::io::config::PipelineConfig;
use crate::io::supervisor::{SupervisedRun, SupervisorSettings, supervise};

/// Parameters for one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub unit: String,
    pub stage: String,
    pub source_dir: PathBuf,
    /// Working directory of the engine process.
    pub workdir: PathBuf,
    /// Rendered script, alive for the duration of the call.
    pub script_path: PathBuf,
    /// Rendered engine arguments.
    pub args: Vec<String>,
}

pub trait Engine {
    /// Run one stage script. `Err` means the engine could not be started or
    /// watched; a hung or failing engine is reported in the returned run.
    fn run(&self, request: &EngineRequest) -> Result<SupervisedRun>;
}

/// Engine that spawns the configured executable under the process supervisor.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    executable: String,
    settings: SupervisorSettings,
}

impl ExternalEngine {
    pub fn new(executable: impl Into<String>, settings: SupervisorSettings) -> Self {
        Self {
            executable: executable.into(),
            settings,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            cfg.engine.executable.clone(),
            SupervisorSettings::from_config(&cfg.supervisor)?,
        ))
    }
}

impl Engine for ExternalEngine {
    fn run(&self, request: &EngineRequest) -> Result<SupervisedRun> {
        info!(unit = %request.unit, stage = %request.stage, "starting engine");
        let mut cmd = Command::new(&self.executable);
        cmd.args(&request.args).current_dir(&request.workdir);
        let label = format!("{}:{}", request.unit, request.stage);
        supervise(cmd, &self.settings, &label).map_err(|err| {
            let not_found = err
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
            if not_found && request.workdir.is_dir() {
                ConfigError::MissingEngine(self.executable.clone()).into()
            } else {
                err
            }
        })
    }
}

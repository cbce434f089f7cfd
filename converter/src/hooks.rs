//! Post-stage hooks: light repair commands run after a stage completes.
//!
//! A hook only runs when the stage earned a marker. A failing hook does not
//! withhold the marker; it downgrades the stage to completed-with-warnings.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::ConfigError;
use crate::io::command::run_with_timeout;
use crate::io::template::{TemplateVars, render_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HookRequest {
    pub stage: String,
    pub vars: TemplateVars,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait PostStageHook: fmt::Debug {
    fn run(&self, request: &HookRequest) -> Result<HookOutcome>;

    /// Render everything that depends on unit paths without running anything.
    fn check(&self, _vars: &TemplateVars) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Hook that runs a templated command line in the unit working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHook {
    argv: Vec<String>,
}

impl CommandHook {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl PostStageHook for CommandHook {
    fn run(&self, request: &HookRequest) -> Result<HookOutcome> {
        let argv = render_args(&self.argv, &request.vars)?;
        info!(
            stage = %request.stage,
            program = argv.first().map(String::as_str),
            "running post-stage hook"
        );
        let output = run_with_timeout(
            &argv,
            &request.workdir,
            request.timeout,
            request.output_limit_bytes,
        )?;
        write_hook_log(&request.log_path, &output.render())?;
        if output.succeeded() {
            Ok(HookOutcome::Passed)
        } else {
            warn!(
                stage = %request.stage,
                timed_out = output.timed_out,
                code = output.status.code(),
                log = %request.log_path.display(),
                "post-stage hook failed"
            );
            Ok(HookOutcome::Failed)
        }
    }

    fn check(&self, vars: &TemplateVars) -> Result<(), ConfigError> {
        render_args(&self.argv, vars).map(drop)
    }
}

fn write_hook_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create hook log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write hook log {}", path.display()))
}

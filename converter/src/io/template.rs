//! Script templater: binds a stage recipe to one work unit's paths.
//!
//! Templates use minijinja syntax with a closed set of placeholders
//! (`source`, `workdir`, `unit`, plus `script` for engine arguments). Rendering
//! is strict: an unknown or unavailable placeholder is a [`ConfigError`], never
//! an empty string.

use std::fs;
use std::path::Path;

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

use crate::errors::ConfigError;

/// Values available to templates.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateVars {
    pub source: String,
    pub workdir: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl TemplateVars {
    pub fn new(unit: &str, source: &Path, workdir: &Path) -> Self {
        Self {
            source: source.display().to_string(),
            workdir: workdir.display().to_string(),
            unit: unit.to_string(),
            script: None,
        }
    }

    pub fn with_script(mut self, script: &Path) -> Self {
        self.script = Some(script.display().to_string());
        self
    }
}

/// A named, unrendered template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTemplate {
    name: String,
    source: String,
}

impl ScriptTemplate {
    pub fn inline(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Read a template file.
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|err| ConfigError::MissingTemplate {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self::inline(name, source))
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String, ConfigError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        env.add_template(&self.name, &self.source)
            .map_err(|err| self.error(err))?;
        let template = env.get_template(&self.name).map_err(|err| self.error(err))?;
        template.render(vars).map_err(|err| self.error(err))
    }

    fn error(&self, err: minijinja::Error) -> ConfigError {
        ConfigError::Template {
            name: self.name.clone(),
            message: format!("{err:#}"),
        }
    }
}

/// Render each engine argument template.
pub fn render_args(args: &[String], vars: &TemplateVars) -> Result<Vec<String>, ConfigError> {
    args.iter()
        .enumerate()
        .map(|(idx, arg)| ScriptTemplate::inline(format!("args[{idx}]"), arg.as_str()).render(vars))
        .collect()
}

//! Fatal configuration errors.
//!
//! Everything else that can go wrong during a batch (engine hangs, bad exit
//! codes, merge failures) is recovered at the stage or merge-item level and
//! reported as an outcome. A [`ConfigError`] means the run cannot succeed at
//! all, so it aborts the batch. It travels inside `anyhow::Error` and is
//! recognized with [`is_config_error`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot read template {}: {message}", path.display())]
    MissingTemplate { path: PathBuf, message: String },

    #[error("template {name}: {message}")]
    Template { name: String, message: String },

    #[error("unit {unit}: source directory {} not found", path.display())]
    MissingSource { unit: String, path: PathBuf },

    #[error("invalid unit pattern {pattern:?}: {message}")]
    UnitPattern { pattern: String, message: String },

    #[error("engine executable {0:?} not found")]
    MissingEngine(String),
}

/// True when `err` (or anything in its context chain) is a [`ConfigError`].
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ConfigError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn detects_config_error_behind_context() {
        let err = Err::<(), _>(ConfigError::Invalid("stages must not be empty".into()))
            .context("load pipeline config")
            .unwrap_err();
        assert!(is_config_error(&err));
        assert!(format!("{err:#}").contains("stages must not be empty"));
    }

    #[test]
    fn other_errors_are_not_config_errors() {
        let err = anyhow::anyhow!("engine stream closed");
        assert!(!is_config_error(&err));
    }
}

//! Classification of engine output lines against sentinel patterns.

use regex::Regex;

use crate::core::types::LineSignal;

/// Compiled sentinel patterns.
///
/// Precedence is abort, then prompt, then error: the legacy engine prints its
/// "stopping execution" notice as part of an error message line, and that line
/// must shorten the grace period rather than merely log.
#[derive(Debug, Clone)]
pub struct Sentinels {
    error: Regex,
    abort: Regex,
    prompt: Regex,
}

impl Sentinels {
    pub fn new(error: &str, abort: &str, prompt: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            error: Regex::new(error)?,
            abort: Regex::new(abort)?,
            prompt: Regex::new(prompt)?,
        })
    }

    pub fn classify(&self, line: &str) -> LineSignal {
        if self.abort.is_match(line) {
            LineSignal::Abort
        } else if self.prompt.is_match(line) {
            LineSignal::Prompt
        } else if self.error.is_match(line) {
            LineSignal::Error
        } else {
            LineSignal::Plain
        }
    }
}

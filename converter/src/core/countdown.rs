//! Liveness countdown driven by engine output.
//!
//! The supervisor owns one [`Countdown`] per process. Every received line resets
//! it to the liveness maximum; sentinel lines then adjust it according to the
//! [`GracePolicy`]. Each idle tick decrements it, and at zero the process tree
//! is terminated.

use crate::core::types::LineSignal;

/// Tick budgets applied after each classified line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    /// Ticks granted after any line of output.
    pub liveness_ticks: u32,
    /// Ticks left after an error line (reduced, never zero).
    pub error_grace_ticks: u32,
    /// Ticks left after an abort line; the engine is expected to exit soon.
    pub abort_grace_ticks: u32,
    /// Ticks left after an interactive prompt, in case the engine gives up by itself.
    pub prompt_grace_ticks: u32,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            liveness_ticks: 60,
            error_grace_ticks: 30,
            abort_grace_ticks: 10,
            prompt_grace_ticks: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Countdown {
    policy: GracePolicy,
    remaining: u32,
    draining: bool,
}

impl Countdown {
    pub fn new(policy: GracePolicy) -> Self {
        Self {
            policy,
            remaining: policy.liveness_ticks,
            draining: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn expired(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Switch to the post-exit budget (the abort grace). From here on lines
    /// no longer extend the countdown, so it always runs out.
    pub fn begin_drain(&mut self) {
        if !self.draining {
            self.draining = true;
            self.remaining = self
                .policy
                .abort_grace_ticks
                .clamp(1, self.policy.liveness_ticks.max(1));
        }
    }

    /// Account for one received line.
    pub fn observe(&mut self, signal: LineSignal) {
        if self.draining {
            return;
        }
        self.remaining = self.policy.liveness_ticks;
        let grace = match signal {
            LineSignal::Plain => return,
            LineSignal::Error => self.policy.error_grace_ticks,
            LineSignal::Abort => self.policy.abort_grace_ticks,
            LineSignal::Prompt => self.policy.prompt_grace_ticks,
        };
        self.remaining = grace.clamp(1, self.policy.liveness_ticks.max(1));
    }

    /// Account for one idle tick. Returns the remaining budget.
    pub fn tick(&mut self) -> u32 {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining
    }
}

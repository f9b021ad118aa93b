//! Run-scoped diagnostics for label resolution.
//!
//! Non-fatal resolution conditions are logged through `tracing` and counted
//! here. Fallback messages are deduplicated per run, so one evaluation does not
//! flood the log with the same notice for every example.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Counters for each non-fatal resolution condition
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Examples resolved by candidate matching
    pub resolved: usize,
    /// Examples where the model generated nothing
    pub empty_outputs: usize,
    /// Examples where no generated token matched any candidate
    pub unmatched: usize,
    /// Ambiguous prefixes after the first step, resolved by an arbitrary pick
    pub ambiguous: usize,
    /// Generations shorter than the expected scaffold
    pub truncated: usize,
}

impl ResolutionStats {
    /// Total examples that went through a fallback path
    #[must_use]
    pub const fn fallbacks(&self) -> usize {
        self.empty_outputs + self.unmatched
    }
}

/// Logger handed to the resolvers for one evaluation run
#[derive(Debug, Default)]
pub struct ResolutionLog {
    seen: HashSet<String>,
    stats: ResolutionStats,
}

impl ResolutionLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters collected so far
    #[must_use]
    pub const fn stats(&self) -> ResolutionStats {
        self.stats
    }

    /// Whether `message` was already emitted in this run
    #[must_use]
    pub fn has_logged(&self, message: &str) -> bool {
        self.seen.contains(message)
    }

    /// Record a label found by candidate matching
    pub fn resolved(&mut self) {
        self.stats.resolved += 1;
    }

    /// Record an example for which the model produced no output
    pub fn empty_output(&mut self, fallback: &str) {
        self.stats.empty_outputs += 1;
        self.debug_once(format!(
            "The model outputted an empty string, so no candidate labels could be \
             determined. Using {fallback:?} as the output label."
        ));
    }

    /// Record an example where no produced token matched a candidate
    pub fn unmatched(&mut self, tokens: &[String], fallback: &str) {
        self.stats.unmatched += 1;
        self.debug_once(format!(
            "Could not find a candidate label for any of the generated labels \
             {tokens:?}. Using {fallback:?} as the output label."
        ));
    }

    /// Record an ambiguous prefix after the first generation step
    pub fn ambiguous(&mut self, probe: &str, candidates: &[&str], chosen: &str) {
        self.stats.ambiguous += 1;
        tracing::warn!(
            probe = %probe,
            candidates = ?candidates,
            chosen = %chosen,
            "Multiple candidate labels match a prefix beyond the first generated \
             token; using an arbitrary match"
        );
    }

    /// Record a generation too short to contain the expected answer segment
    pub fn truncated(&mut self, expected_segment: usize) {
        self.stats.truncated += 1;
        self.debug_once(format!(
            "Generated text has no paragraph {expected_segment}; using the whole \
             decoded text as the prediction."
        ));
    }

    fn debug_once(&mut self, message: String) {
        if self.seen.insert(message.clone()) {
            tracing::debug!("{message}");
        }
    }
}

//! Label resolution from ranked per-step token log-probabilities.
//!
//! Generation is greedy, so the top token at each step is what the model
//! produced and the tokens ranked below it are the runner-up alternatives.
//! A label is found by growing a prefix until it selects exactly one class:
//!
//! ```text
//! step 0: ["ye", "no"]   probe "ye"  -> {yes, yellow}  ambiguous, accumulate
//! step 1: ["s", "llow"]  probe "yes" -> {yes}          resolved
//! ```
//!
//! Only an ambiguity at step 0 is carried forward. An ambiguity at a later
//! step is settled by taking the first matching class in universe order.

use crate::diagnostics::ResolutionLog;
use crate::labels::{CandidateLabelSet, LabelSpace};

/// A generated token together with its log-probability
pub type TokenLogprob = (String, f64);

/// Ranked alternatives at one generation step, most likely first
pub type StepLogprobs = Vec<TokenLogprob>;

/// Accented letters kept when cleaning generated tokens
const ACCENTED_LETTERS: [char; 6] = ['æ', 'ø', 'å', 'ü', 'ö', 'ä'];

/// Prefix disambiguation state for one example
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixState {
    /// No unique class yet; holds the confirmed prefix
    Accumulating(String),
    /// A class id has been selected
    Resolved(usize),
    /// All steps consumed without a selection
    Exhausted,
}

impl PrefixState {
    /// Apply one generation step to the state
    ///
    /// Terminal states are returned unchanged.
    #[must_use]
    pub fn advance(
        self,
        step_index: usize,
        tokens: &[String],
        labels: &CandidateLabelSet,
        log: &mut ResolutionLog,
    ) -> Self {
        let prefix = match self {
            Self::Accumulating(prefix) => prefix,
            terminal => return terminal,
        };

        for token in tokens {
            let probe = format!("{prefix}{token}");
            let classes = labels.classes_with_prefix(&probe);

            match classes.as_slice() {
                [] => continue,
                [class_id] => return Self::Resolved(*class_id),
                [..] if step_index == 0 => return Self::Accumulating(probe),
                [first, ..] => {
                    let names: Vec<&str> = classes
                        .iter()
                        .filter_map(|&id| labels.label(id, LabelSpace::Canonical))
                        .collect();
                    let chosen = labels
                        .label(*first, LabelSpace::Canonical)
                        .unwrap_or_default();
                    log.ambiguous(&probe, &names, chosen);
                    return Self::Resolved(*first);
                }
            }
        }

        Self::Accumulating(prefix)
    }

    /// Mark a non-terminal state as exhausted
    #[must_use]
    pub fn finish(self) -> Self {
        match self {
            Self::Accumulating(_) => Self::Exhausted,
            terminal => terminal,
        }
    }
}

/// Lower-case a token and strip characters outside the label alphabet from
/// both ends
#[must_use]
pub fn clean_token(token: &str) -> String {
    token
        .to_lowercase()
        .trim_matches(|c: char| !is_label_char(c))
        .to_string()
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_lowercase() || ACCENTED_LETTERS.contains(&c)
}

/// Resolves labels from ranked generation log-probabilities
#[derive(Debug, Clone, Copy)]
pub struct LogprobLabelResolver<'a> {
    labels: &'a CandidateLabelSet,
}

impl<'a> LogprobLabelResolver<'a> {
    /// Create a resolver over a dataset's candidate labels
    #[must_use]
    pub const fn new(labels: &'a CandidateLabelSet) -> Self {
        Self { labels }
    }

    /// Resolve one example to a class id
    ///
    /// Always returns a class id: when no step selects a class, the class of
    /// the first universe entry is used and the fallback is logged.
    pub fn resolve_class(&self, steps: &[StepLogprobs], log: &mut ResolutionLog) -> usize {
        let mut state = PrefixState::Accumulating(String::new());

        for (step_index, step) in steps.iter().enumerate() {
            let tokens: Vec<String> = step
                .iter()
                .map(|(token, _)| clean_token(token))
                .filter(|token| !token.is_empty())
                .collect();

            state = state.advance(step_index, &tokens, self.labels, log);
            if matches!(state, PrefixState::Resolved(_)) {
                break;
            }
        }

        match state.finish() {
            PrefixState::Resolved(class_id) => {
                log.resolved();
                class_id
            }
            _ => {
                let fallback = &self.labels.universe()[0];
                if steps.is_empty() {
                    log.empty_output(fallback);
                } else {
                    let produced: Vec<String> = steps
                        .iter()
                        .filter_map(|step| step.first().map(|(token, _)| token.clone()))
                        .collect();
                    log.unmatched(&produced, fallback);
                }
                self.labels.fallback_class()
            }
        }
    }

    /// Resolve one example to a label in the requested space
    pub fn resolve(
        &self,
        steps: &[StepLogprobs],
        space: LabelSpace,
        log: &mut ResolutionLog,
    ) -> String {
        let class_id = self.resolve_class(steps, log);
        self.labels
            .label(class_id, space)
            .unwrap_or_default()
            .to_string()
    }

    /// Resolve every example of a batch; output has one label per example
    pub fn resolve_batch(
        &self,
        batch: &[Vec<StepLogprobs>],
        space: LabelSpace,
        log: &mut ResolutionLog,
    ) -> Vec<String> {
        batch
            .iter()
            .map(|steps| self.resolve(steps, space, log))
            .collect()
    }
}

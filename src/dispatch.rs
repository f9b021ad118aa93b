//! Chooses a label resolver for a batch of generation output.
//!
//! When the backend reported ranked log-probabilities the prefix resolver is
//! used; otherwise the answer span is extracted from the decoded text and
//! resolved by edit distance. The choice is made once per batch.

use crate::config::DatasetConfig;
use crate::diagnostics::ResolutionLog;
use crate::edit_distance::EditDistanceLabelResolver;
use crate::extract::{RawPredictionExtractor, SpecialTokens, TokenDecoder};
use crate::labels::{CandidateLabelSet, LabelError, LabelSpace};
use crate::logprobs::{LogprobLabelResolver, StepLogprobs};
use thiserror::Error;

/// Errors raised while dispatching a batch
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Generation returned token ids but no decoder was supplied")]
    MissingDecoder,

    #[error("Invalid candidate labels: {0}")]
    Labels(#[from] LabelError),
}

/// What the generation backend returned for a batch
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    /// Ranked `(token, logprob)` alternatives per step, per example
    Logprobs(Vec<Vec<StepLogprobs>>),
    /// Decoded text per example
    Text(Vec<String>),
    /// Generated token ids per example
    TokenIds(Vec<Vec<u32>>),
}

impl GenerationOutput {
    /// Number of examples in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Logprobs(batch) => batch.len(),
            Self::Text(batch) => batch.len(),
            Self::TokenIds(batch) => batch.len(),
        }
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backend reported score information
    #[must_use]
    pub const fn has_scores(&self) -> bool {
        matches!(self, Self::Logprobs(_))
    }
}

/// Routes generation output to the matching resolver
pub struct LabelResolutionDispatcher<'a> {
    labels: &'a CandidateLabelSet,
    extractor: RawPredictionExtractor,
    edit_resolver: EditDistanceLabelResolver,
    special_tokens: SpecialTokens,
    decoder: Option<&'a dyn TokenDecoder>,
}

impl<'a> LabelResolutionDispatcher<'a> {
    /// Create a dispatcher for a dataset
    ///
    /// # Errors
    ///
    /// Returns an error if the label set has no localized labels.
    pub fn new(labels: &'a CandidateLabelSet, config: &DatasetConfig) -> Result<Self, DispatchError> {
        Ok(Self {
            labels,
            extractor: RawPredictionExtractor::from_config(config),
            edit_resolver: EditDistanceLabelResolver::new(labels.localized_labels().iter().cloned())?,
            special_tokens: SpecialTokens::default(),
            decoder: None,
        })
    }

    /// Attach a decoder for token-id output
    #[must_use]
    pub fn with_decoder(mut self, decoder: &'a dyn TokenDecoder, special_tokens: SpecialTokens) -> Self {
        self.decoder = Some(decoder);
        self.special_tokens = special_tokens;
        self
    }

    /// Replace the answer-span extractor
    #[must_use]
    pub const fn with_extractor(mut self, extractor: RawPredictionExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Resolve every example of the batch to a class id
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::MissingDecoder` for token-id output without a
    /// decoder.
    pub fn resolve_classes(
        &self,
        output: &GenerationOutput,
        log: &mut ResolutionLog,
    ) -> Result<Vec<usize>, DispatchError> {
        let classes = match output {
            GenerationOutput::Logprobs(batch) => {
                let resolver = LogprobLabelResolver::new(self.labels);
                batch
                    .iter()
                    .map(|steps| resolver.resolve_class(steps, log))
                    .collect()
            }
            GenerationOutput::Text(texts) => texts
                .iter()
                .map(|text| self.resolve_text(text, log))
                .collect(),
            GenerationOutput::TokenIds(sequences) => {
                let decoder = self.decoder.ok_or(DispatchError::MissingDecoder)?;
                sequences
                    .iter()
                    .map(|ids| {
                        let text = self.special_tokens.decode_clean(decoder, ids);
                        self.resolve_text(&text, log)
                    })
                    .collect()
            }
        };
        Ok(classes)
    }

    /// Resolve every example of the batch to a label in `space`
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::MissingDecoder` for token-id output without a
    /// decoder.
    pub fn extract_labels(
        &self,
        output: &GenerationOutput,
        space: LabelSpace,
        log: &mut ResolutionLog,
    ) -> Result<Vec<String>, DispatchError> {
        let classes = self.resolve_classes(output, log)?;
        Ok(classes
            .into_iter()
            .map(|id| self.labels.label(id, space).unwrap_or_default().to_string())
            .collect())
    }

    fn resolve_text(&self, decoded: &str, log: &mut ResolutionLog) -> usize {
        let answer = self.extractor.extract(decoded, log);
        log.resolved();
        self.edit_resolver.closest_index(&answer)
    }
}

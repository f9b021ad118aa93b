//! Answer-span extraction from decoded generations.
//!
//! Some backends echo the whole prompt back, so the decoded text still holds
//! the few-shot scaffold:
//!
//! ```text
//! [instruction]\n\n
//! Text: ...\nLabel: positive\n\n      <- few-shot exemplar
//! Text: ...\nLabel: negative\n\n      <- few-shot exemplar
//! Text: ...\nLabel: neutral           <- the current example
//! ```
//!
//! The answer is the last field of the last line of the paragraph belonging to
//! the current example.

use crate::config::DatasetConfig;
use crate::diagnostics::ResolutionLog;

/// Separator between prompt paragraphs
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Separator between a field name and its value
pub const FIELD_SEPARATOR: char = ':';

/// Decodes token ids into text
pub trait TokenDecoder {
    /// Decode a sequence of token ids
    fn decode(&self, token_ids: &[u32]) -> String;
}

/// Beginning and end of sequence markers of a tokenizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Beginning-of-sequence token id
    pub bos: Option<u32>,
    /// End-of-sequence token id
    pub eos: Option<u32>,
}

impl SpecialTokens {
    /// Drop BOS and EOS tokens from a generated sequence
    #[must_use]
    pub fn strip(&self, token_ids: &[u32]) -> Vec<u32> {
        token_ids
            .iter()
            .copied()
            .filter(|&id| Some(id) != self.bos && Some(id) != self.eos)
            .collect()
    }

    /// Strip special tokens and decode
    pub fn decode_clean<D: TokenDecoder + ?Sized>(&self, decoder: &D, token_ids: &[u32]) -> String {
        decoder.decode(&self.strip(token_ids))
    }
}

/// Pulls the current example's answer out of a decoded generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPredictionExtractor {
    answer_paragraph: usize,
}

impl RawPredictionExtractor {
    /// Create an extractor expecting the answer in paragraph `answer_paragraph`
    #[must_use]
    pub const fn new(answer_paragraph: usize) -> Self {
        Self { answer_paragraph }
    }

    /// Paragraph index derived from the dataset's prompt layout
    #[must_use]
    pub const fn from_config(config: &DatasetConfig) -> Self {
        let mut index = config.num_few_shot_examples + 1;
        if config.prompt_instruction_infix {
            index += 1;
        }
        Self::new(index)
    }

    /// Index of the paragraph holding the answer
    #[must_use]
    pub const fn answer_paragraph(&self) -> usize {
        self.answer_paragraph
    }

    /// Extract the answer span, or `None` if the paragraph is absent
    #[must_use]
    pub fn try_extract<'t>(&self, decoded: &'t str) -> Option<&'t str> {
        let paragraph = decoded.split(PARAGRAPH_SEPARATOR).nth(self.answer_paragraph)?;
        let line = paragraph.split('\n').last().unwrap_or(paragraph);
        let field = line.rsplit(FIELD_SEPARATOR).next().unwrap_or(line);
        Some(field.trim())
    }

    /// Extract the answer span, falling back to the whole trimmed text
    pub fn extract(&self, decoded: &str, log: &mut ResolutionLog) -> String {
        if let Some(answer) = self.try_extract(decoded) {
            answer.to_string()
        } else {
            log.truncated(self.answer_paragraph);
            decoded.trim().to_string()
        }
    }

    /// Extract the answer span of every decoded generation
    pub fn extract_batch<S: AsRef<str>>(&self, decoded: &[S], log: &mut ResolutionLog) -> Vec<String> {
        decoded
            .iter()
            .map(|text| self.extract(text.as_ref(), log))
            .collect()
    }
}

/// Stop criteria over generated token ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSequences {
    sequences: Vec<Vec<u32>>,
}

impl StopSequences {
    /// Build from token-id sequences; empty sequences are ignored
    #[must_use]
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self {
            sequences: sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Standard stops: a paragraph break, two line breaks, BOS and EOS
    #[must_use]
    pub fn standard(
        double_newline: &[u32],
        single_newline: &[u32],
        special: SpecialTokens,
    ) -> Self {
        let two_newlines = [single_newline, single_newline].concat();
        let mut sequences = vec![double_newline.to_vec(), two_newlines];
        sequences.extend(special.bos.map(|id| vec![id]));
        sequences.extend(special.eos.map(|id| vec![id]));
        Self::new(sequences)
    }

    /// Configured stop sequences
    #[must_use]
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    /// Whether the generated ids end with any stop sequence
    #[must_use]
    pub fn should_stop(&self, generated: &[u32]) -> bool {
        self.sequences.iter().any(|stop| generated.ends_with(stop))
    }
}

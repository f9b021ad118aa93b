//! End-to-end evaluation runner.
//!
//! Reads generation records, resolves each iteration's batch to class ids,
//! scores it with the metric engine and aggregates the iterations.

use crate::config::{ConfigError, DatasetConfig};
use crate::diagnostics::{ResolutionLog, ResolutionStats};
use crate::dispatch::{DispatchError, GenerationOutput, LabelResolutionDispatcher};
use crate::extract::{SpecialTokens, TokenDecoder};
use crate::labels::{CandidateLabelSet, LabelSpace};
use crate::logprobs::StepLogprobs;
use crate::metrics::{
    LabelValue, MetricAggregationEngine, MetricError, MetricRegistry, MetricResult, ModelOutputs,
};
use crate::scores::{aggregate, ScoreSummary, StatConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while running an evaluation
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid dataset configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Label resolution failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Metric computation failed: {0}")]
    Metric(#[from] MetricError),

    #[error("Record {0} has no logprobs, text or token ids")]
    EmptyRecord(usize),

    #[error("Iteration {0} mixes text and token-id records")]
    MixedBatch(usize),

    #[error("Invalid record on line {line}: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("No generation records")]
    NoRecords,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One model generation with its gold label, as stored in JSONL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRecord {
    /// Ranked `(token, logprob)` alternatives per generation step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<StepLogprobs>>,
    /// Decoded generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Generated token ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ids: Option<Vec<u32>>,
    /// Gold label, as class id or label string
    pub reference: LabelValue,
    /// Bootstrapped iteration this record belongs to
    #[serde(default)]
    pub iteration: usize,
}

impl GenerationRecord {
    fn is_empty(&self) -> bool {
        self.logprobs.is_none() && self.text.is_none() && self.token_ids.is_none()
    }
}

/// Read JSONL generation records; blank lines are skipped
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is not a record.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<GenerationRecord>, RunnerError> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut records = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| RunnerError::InvalidRecord {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Result of evaluating every iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    /// Metric scores per iteration, in iteration order
    pub per_iteration: Vec<MetricResult>,
    /// Cross-iteration summary per metric
    pub summary: BTreeMap<String, ScoreSummary>,
    /// Resolution diagnostics for the whole run
    pub stats: ResolutionStats,
}

/// Runs label resolution and scoring for one dataset
pub struct EvalRunner {
    config: DatasetConfig,
    labels: CandidateLabelSet,
    registry: MetricRegistry,
    stat_config: StatConfig,
    decoder: Option<(Box<dyn TokenDecoder>, SpecialTokens)>,
}

impl EvalRunner {
    /// Validate the dataset configuration and build a runner
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or names a metric the
    /// registry does not know.
    pub fn new(config: DatasetConfig, registry: MetricRegistry) -> Result<Self, RunnerError> {
        let labels = config.validate()?;
        if let Some(missing) = config
            .task
            .metrics
            .iter()
            .find(|m| !registry.contains(&m.metric_id))
        {
            return Err(MetricError::UnknownMetric(missing.metric_id.clone()).into());
        }
        Ok(Self {
            config,
            labels,
            registry,
            stat_config: StatConfig::default(),
            decoder: None,
        })
    }

    /// Set the statistical configuration used for aggregation
    #[must_use]
    pub fn with_stat_config(mut self, stat_config: StatConfig) -> Self {
        self.stat_config = stat_config;
        self
    }

    /// Attach a decoder for token-id records
    #[must_use]
    pub fn with_decoder(mut self, decoder: Box<dyn TokenDecoder>, special_tokens: SpecialTokens) -> Self {
        self.decoder = Some((decoder, special_tokens));
        self
    }

    /// Dataset configuration
    #[must_use]
    pub const fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Candidate labels of the dataset
    #[must_use]
    pub const fn labels(&self) -> &CandidateLabelSet {
        &self.labels
    }

    fn dispatcher(&self) -> Result<LabelResolutionDispatcher<'_>, RunnerError> {
        let dispatcher = LabelResolutionDispatcher::new(&self.labels, &self.config)?;
        Ok(match &self.decoder {
            Some((decoder, special)) => dispatcher.with_decoder(decoder.as_ref(), *special),
            None => dispatcher,
        })
    }

    /// Resolve one batch and score it against its references
    ///
    /// # Errors
    ///
    /// Returns an error if resolution or any metric computation fails.
    pub fn evaluate_batch(
        &self,
        output: &GenerationOutput,
        references: &[LabelValue],
        log: &mut ResolutionLog,
    ) -> Result<MetricResult, RunnerError> {
        let classes = self.dispatcher()?.resolve_classes(output, log)?;
        let engine = MetricAggregationEngine::new(&self.labels, &self.config.task.metrics, &self.registry)?;
        let predictions = ModelOutputs::Labels(classes.into_iter().map(LabelValue::Id).collect());
        Ok(engine.compute(&predictions, references)?)
    }

    /// Resolve every record to a label in `space`, in input order
    ///
    /// # Errors
    ///
    /// Returns an error if a record is empty or a batch cannot be resolved.
    pub fn resolve_records(
        &self,
        records: &[GenerationRecord],
        space: LabelSpace,
        log: &mut ResolutionLog,
    ) -> Result<Vec<String>, RunnerError> {
        let dispatcher = self.dispatcher()?;
        let mut labels = vec![String::new(); records.len()];
        for (iteration, indices) in group_by_iteration(records)? {
            let batch: Vec<&GenerationRecord> = indices.iter().map(|&i| &records[i]).collect();
            let output = batch_output(iteration, &batch)?;
            let resolved = dispatcher.extract_labels(&output, space, log)?;
            for (index, label) in indices.into_iter().zip(resolved) {
                labels[index] = label;
            }
        }
        Ok(labels)
    }

    /// Evaluate every iteration and aggregate the scores
    ///
    /// # Errors
    ///
    /// Returns an error if there are no records, a record is empty, or any
    /// batch fails to resolve or score.
    pub fn evaluate_records(&self, records: &[GenerationRecord]) -> Result<EvaluationOutcome, RunnerError> {
        if records.is_empty() {
            return Err(RunnerError::NoRecords);
        }

        let mut log = ResolutionLog::new();
        let mut per_iteration = Vec::new();
        for (iteration, indices) in group_by_iteration(records)? {
            let batch: Vec<&GenerationRecord> = indices.iter().map(|&i| &records[i]).collect();
            let output = batch_output(iteration, &batch)?;
            let references: Vec<LabelValue> = batch.iter().map(|r| r.reference.clone()).collect();
            let scores = self.evaluate_batch(&output, &references, &mut log)?;
            tracing::info!(
                dataset = %self.config.name,
                iteration,
                examples = batch.len(),
                scores = ?scores,
                "Scored iteration"
            );
            per_iteration.push(scores);
        }

        let stats = log.stats();
        if stats.fallbacks() > 0 {
            tracing::info!(
                empty_outputs = stats.empty_outputs,
                unmatched = stats.unmatched,
                "Some predictions fell back to the default label"
            );
        }

        Ok(EvaluationOutcome {
            summary: aggregate(&per_iteration, &self.stat_config),
            per_iteration,
            stats,
        })
    }
}

/// Record indices per iteration, in ascending iteration order
fn group_by_iteration(records: &[GenerationRecord]) -> Result<BTreeMap<usize, Vec<usize>>, RunnerError> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        if record.is_empty() {
            return Err(RunnerError::EmptyRecord(index));
        }
        groups.entry(record.iteration).or_default().push(index);
    }
    Ok(groups)
}

/// Build one batch; logprobs are used only if every record carries them
fn batch_output(iteration: usize, batch: &[&GenerationRecord]) -> Result<GenerationOutput, RunnerError> {
    if let Some(steps) = batch.iter().map(|r| r.logprobs.clone()).collect::<Option<Vec<_>>>() {
        return Ok(GenerationOutput::Logprobs(steps));
    }
    if let Some(texts) = batch.iter().map(|r| r.text.clone()).collect::<Option<Vec<_>>>() {
        return Ok(GenerationOutput::Text(texts));
    }
    if let Some(ids) = batch.iter().map(|r| r.token_ids.clone()).collect::<Option<Vec<_>>>() {
        return Ok(GenerationOutput::TokenIds(ids));
    }
    Err(RunnerError::MixedBatch(iteration))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn runner() -> EvalRunner {
        let config = DatasetConfig::load("datasets/angry-tweets.yaml").unwrap();
        EvalRunner::new(config, MetricRegistry::builtin()).unwrap()
    }

    fn text_record(text: &str, reference: &str, iteration: usize) -> GenerationRecord {
        GenerationRecord {
            logprobs: None,
            text: Some(text.to_string()),
            token_ids: None,
            reference: reference.into(),
            iteration,
        }
    }

    fn logprob_record(token: &str, reference: usize) -> GenerationRecord {
        GenerationRecord {
            logprobs: Some(vec![vec![(token.to_string(), -0.2)]]),
            text: Some(token.to_string()),
            token_ids: None,
            reference: LabelValue::Id(reference),
            iteration: 0,
        }
    }

    // =========================================================================
    // Records
    // =========================================================================

    #[test]
    fn test_record_parsing() {
        let line = r#"{"logprobs": [[["posi", -0.1], ["neg", -2.0]]], "reference": "positive"}"#;
        let record: GenerationRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.iteration, 0);
        assert_eq!(record.reference, LabelValue::Label("positive".to_string()));
        assert_eq!(record.logprobs.unwrap()[0][1], ("neg".to_string(), -2.0));
    }

    #[test]
    fn test_load_records_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "positiv", "reference": 2}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"text": "negativ", "reference": 0, "iteration": 1}}"#).unwrap();
        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].iteration, 1);
    }

    #[test]
    fn test_load_records_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "ja", "reference": 0}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        let err = load_records(file.path()).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRecord { line: 2, .. }));
    }

    #[test]
    fn test_empty_record_rejected() {
        let record = GenerationRecord {
            logprobs: None,
            text: None,
            token_ids: None,
            reference: LabelValue::Id(0),
            iteration: 0,
        };
        let result = runner().evaluate_records(&[record]);
        assert!(matches!(result, Err(RunnerError::EmptyRecord(0))));
    }

    #[test]
    fn test_no_records_rejected() {
        assert!(matches!(runner().evaluate_records(&[]), Err(RunnerError::NoRecords)));
    }

    // =========================================================================
    // Batches
    // =========================================================================

    #[test]
    fn test_logprobs_used_only_when_every_record_has_them() {
        let with = logprob_record("posi", 2);
        let without = text_record("positiv", "positive", 0);
        let output = batch_output(0, &[&with, &with]).unwrap();
        assert!(output.has_scores());
        let output = batch_output(0, &[&with, &without]).unwrap();
        assert!(!output.has_scores());
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn test_mixed_text_and_token_ids_rejected() {
        let text = text_record("ja", "positive", 3);
        let ids = GenerationRecord {
            logprobs: None,
            text: None,
            token_ids: Some(vec![1, 2]),
            reference: LabelValue::Id(0),
            iteration: 3,
        };
        assert!(matches!(batch_output(3, &[&text, &ids]), Err(RunnerError::MixedBatch(3))));
    }

    #[test]
    fn test_evaluate_batch_perfect_predictions() {
        let runner = runner();
        let mut log = ResolutionLog::new();
        let output = GenerationOutput::Text(vec!["negativ".into(), "neutral".into(), "positiv".into()]);
        let references: Vec<LabelValue> = vec!["negative".into(), "neutral".into(), "positive".into()];
        let scores = runner.evaluate_batch(&output, &references, &mut log).unwrap();
        assert!((scores["mcc"] - 1.0).abs() < 1e-12);
        assert!((scores["macro_f1"] - 1.0).abs() < 1e-12);
    }

    // =========================================================================
    // Full runs
    // =========================================================================

    #[test]
    fn test_evaluate_records_groups_iterations() {
        let records = vec![
            text_record("negativ", "negative", 0),
            text_record("positiv", "positive", 0),
            text_record("negativ", "negative", 1),
            text_record("negativ", "positive", 1),
        ];
        let outcome = runner().evaluate_records(&records).unwrap();
        assert_eq!(outcome.per_iteration.len(), 2);
        assert!((outcome.per_iteration[0]["mcc"] - 1.0).abs() < 1e-12);
        assert_eq!(outcome.summary["mcc"].iterations, 2);
        assert_eq!(outcome.stats.resolved, 4);
    }

    #[test]
    fn test_resolve_records_keeps_input_order() {
        let records = vec![
            text_record("positiv", "positive", 1),
            text_record("negativ", "negative", 0),
            text_record("neutral", "neutral", 1),
        ];
        let mut log = ResolutionLog::new();
        let labels = runner()
            .resolve_records(&records, LabelSpace::Canonical, &mut log)
            .unwrap();
        assert_eq!(labels, vec!["positive", "negative", "neutral"]);
    }

    #[test]
    fn test_unknown_metric_rejected_at_construction() {
        let config = DatasetConfig::load("datasets/angry-tweets.yaml").unwrap();
        let result = EvalRunner::new(config, MetricRegistry::new());
        assert!(matches!(
            result,
            Err(RunnerError::Metric(MetricError::UnknownMetric(_)))
        ));
    }
}

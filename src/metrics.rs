//! Metric aggregation engine.
//!
//! Normalises predictions and references into class ids, invokes each
//! configured metric backend and shapes its output into one scalar per metric
//! name:
//!
//! ```text
//! class scores ──argmax──┐
//! label ids ─────────────┼──> class ids ──> backend.compute ──> results_key ──> mean ──> f64
//! label strings ─lookup──┘
//! ```
//!
//! NaN in raw model output aborts the call. A backend that returns no result
//! (a non-coordinating process in multi-process execution) is left out of the
//! mapping.

use crate::classification::BuiltinMetric;
use crate::config::{ComputeArgs, MetricConfig};
use crate::labels::CandidateLabelSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Errors that abort a metric computation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Model output contains NaN values at example {0}")]
    NanOutput(usize),

    #[error("Model output has no class scores at example {0}")]
    EmptyScores(usize),

    #[error("Unknown label {0:?}")]
    UnknownLabel(String),

    #[error("Unknown metric identifier: {0}")]
    UnknownMetric(String),

    #[error("Metric {metric} returned no {key:?} entry")]
    MissingResultKey { metric: String, key: String },

    #[error("Metric {0} returned an empty per-class list")]
    EmptyPerClass(String),

    #[error("Got {predictions} predictions but {references} references")]
    LengthMismatch {
        predictions: usize,
        references: usize,
    },

    #[error("Invalid metric argument: {0}")]
    InvalidArgument(String),
}

/// A value produced by a metric backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScoreValue {
    /// A single score
    Scalar(f64),
    /// One score per class
    PerClass(Vec<f64>),
}

/// Raw output of a metric backend
pub type ScoreMap = HashMap<String, ScoreValue>;

/// Metric name to scalar score
pub type MetricResult = BTreeMap<String, f64>;

/// An external metric implementation
pub trait MetricBackend: Send + Sync {
    /// Score predictions against references
    ///
    /// Returns `Ok(None)` when this process does not produce the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are invalid for this metric.
    fn compute(
        &self,
        predictions: &[usize],
        references: &[usize],
        kwargs: &ComputeArgs,
    ) -> Result<Option<ScoreMap>, MetricError>;
}

/// Runs the wrapped backend on the coordinating process only
pub struct CoordinatorOnly {
    inner: Arc<dyn MetricBackend>,
    rank: usize,
}

impl CoordinatorOnly {
    /// Wrap `inner` for the process with the given rank; rank 0 coordinates
    #[must_use]
    pub fn new(inner: Arc<dyn MetricBackend>, rank: usize) -> Self {
        Self { inner, rank }
    }
}

impl MetricBackend for CoordinatorOnly {
    fn compute(
        &self,
        predictions: &[usize],
        references: &[usize],
        kwargs: &ComputeArgs,
    ) -> Result<Option<ScoreMap>, MetricError> {
        if self.rank != 0 {
            return Ok(None);
        }
        self.inner.compute(predictions, references, kwargs)
    }
}

/// Metric backends by identifier
#[derive(Clone, Default)]
pub struct MetricRegistry {
    backends: HashMap<String, Arc<dyn MetricBackend>>,
}

impl MetricRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in metric
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for metric in BuiltinMetric::ALL {
            registry.register(metric.id(), Arc::new(metric));
        }
        registry
    }

    /// Builtins wrapped so that only process `rank` 0 reports results
    #[must_use]
    pub fn builtin_for_rank(rank: usize) -> Self {
        let mut registry = Self::new();
        for metric in BuiltinMetric::ALL {
            registry.register(
                metric.id(),
                Arc::new(CoordinatorOnly::new(Arc::new(metric), rank)),
            );
        }
        registry
    }

    /// Register or replace a backend
    pub fn register(&mut self, id: &str, backend: Arc<dyn MetricBackend>) {
        self.backends.insert(id.to_string(), backend);
    }

    /// Look up a backend
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn MetricBackend>> {
        self.backends.get(id)
    }

    /// Whether a backend is registered under `id`
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// Registered identifiers, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}

/// A prediction or reference: a class id or a label string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LabelValue {
    /// Numeric class id
    Id(usize),
    /// Canonical or localized label
    Label(String),
}

impl From<usize> for LabelValue {
    fn from(id: usize) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for LabelValue {
    fn from(label: &str) -> Self {
        Self::Label(label.to_string())
    }
}

impl From<String> for LabelValue {
    fn from(label: String) -> Self {
        Self::Label(label)
    }
}

/// Model output handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutputs {
    /// Class-score vectors, reduced by arg-max
    ClassScores(Vec<Vec<f64>>),
    /// Already-resolved ids or labels
    Labels(Vec<LabelValue>),
}

impl ModelOutputs {
    /// Number of examples
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::ClassScores(rows) => rows.len(),
            Self::Labels(values) => values.len(),
        }
    }

    /// Whether there are no examples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fail if any class score is NaN
///
/// # Errors
///
/// Returns `MetricError::NanOutput` with the index of the first offending
/// example.
pub fn raise_if_nan(outputs: &ModelOutputs) -> Result<(), MetricError> {
    if let ModelOutputs::ClassScores(rows) = outputs {
        if let Some(index) = rows.iter().position(|row| row.iter().any(|v| v.is_nan())) {
            return Err(MetricError::NanOutput(index));
        }
    }
    Ok(())
}

/// Index of the largest score; ties go to the lowest index
fn argmax(row: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &value) in row.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// Scores normalised predictions with the configured metrics
pub struct MetricAggregationEngine<'a> {
    labels: &'a CandidateLabelSet,
    metrics: &'a [MetricConfig],
    registry: &'a MetricRegistry,
}

impl<'a> MetricAggregationEngine<'a> {
    /// Create an engine, checking every metric has a backend
    ///
    /// # Errors
    ///
    /// Returns `MetricError::UnknownMetric` for an unregistered identifier.
    pub fn new(
        labels: &'a CandidateLabelSet,
        metrics: &'a [MetricConfig],
        registry: &'a MetricRegistry,
    ) -> Result<Self, MetricError> {
        if let Some(missing) = metrics.iter().find(|m| !registry.contains(&m.metric_id)) {
            return Err(MetricError::UnknownMetric(missing.metric_id.clone()));
        }
        Ok(Self {
            labels,
            metrics,
            registry,
        })
    }

    /// Map ids through unchanged and labels to their class id
    ///
    /// # Errors
    ///
    /// Returns `MetricError::UnknownLabel` for a string that is neither a
    /// localized nor a canonical label.
    pub fn normalize(&self, values: &[LabelValue]) -> Result<Vec<usize>, MetricError> {
        values
            .iter()
            .map(|value| match value {
                LabelValue::Id(id) => Ok(*id),
                LabelValue::Label(label) => self
                    .labels
                    .class_of(label)
                    .ok_or_else(|| MetricError::UnknownLabel(label.clone())),
            })
            .collect()
    }

    /// Turn model output into class ids
    ///
    /// # Errors
    ///
    /// Returns an error on NaN scores, empty score rows or unknown labels.
    pub fn predictions(&self, outputs: &ModelOutputs) -> Result<Vec<usize>, MetricError> {
        raise_if_nan(outputs)?;
        match outputs {
            ModelOutputs::ClassScores(rows) => rows
                .iter()
                .enumerate()
                .map(|(index, row)| argmax(row).ok_or(MetricError::EmptyScores(index)))
                .collect(),
            ModelOutputs::Labels(values) => self.normalize(values),
        }
    }

    /// Compute every configured metric
    ///
    /// # Errors
    ///
    /// Returns an error on NaN output, unknown labels, mismatched lengths, or
    /// a malformed backend result.
    pub fn compute(
        &self,
        outputs: &ModelOutputs,
        references: &[LabelValue],
    ) -> Result<MetricResult, MetricError> {
        let predictions = self.predictions(outputs)?;
        let references = self.normalize(references)?;
        if predictions.len() != references.len() {
            return Err(MetricError::LengthMismatch {
                predictions: predictions.len(),
                references: references.len(),
            });
        }

        let mut results = MetricResult::new();
        for config in self.metrics {
            let backend = self
                .registry
                .get(&config.metric_id)
                .ok_or_else(|| MetricError::UnknownMetric(config.metric_id.clone()))?;

            let Some(scores) = backend.compute(&predictions, &references, &config.compute_kwargs)?
            else {
                tracing::debug!(metric = %config.name, "Metric returned no result on this process");
                continue;
            };

            let value = scores
                .get(&config.results_key)
                .ok_or_else(|| MetricError::MissingResultKey {
                    metric: config.name.clone(),
                    key: config.results_key.clone(),
                })?;

            results.insert(config.name.clone(), reduce(&config.name, value)?);
        }

        Ok(results)
    }
}

/// Reduce a per-class list to its unweighted mean
#[allow(clippy::cast_precision_loss)]
fn reduce(name: &str, value: &ScoreValue) -> Result<f64, MetricError> {
    match value {
        ScoreValue::Scalar(score) => Ok(*score),
        ScoreValue::PerClass(scores) if scores.is_empty() => {
            Err(MetricError::EmptyPerClass(name.to_string()))
        }
        ScoreValue::PerClass(scores) => Ok(scores.iter().sum::<f64>() / scores.len() as f64),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn labels() -> CandidateLabelSet {
        let ids = vec!["negative".to_string(), "positive".to_string()];
        let map = HashMap::from([
            ("negative".to_string(), "Negativ".to_string()),
            ("positive".to_string(), "Positiv".to_string()),
        ]);
        CandidateLabelSet::new(&ids, &map).unwrap()
    }

    fn metric(name: &str, id: &str, key: &str) -> MetricConfig {
        MetricConfig {
            name: name.to_string(),
            metric_id: id.to_string(),
            results_key: key.to_string(),
            compute_kwargs: ComputeArgs::new(),
        }
    }

    /// Backend returning a fixed score map and counting its calls
    struct Fixed {
        scores: Option<ScoreMap>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(scores: Option<ScoreMap>) -> Arc<Self> {
            Arc::new(Self {
                scores,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl MetricBackend for Fixed {
        fn compute(
            &self,
            _predictions: &[usize],
            _references: &[usize],
            _kwargs: &ComputeArgs,
        ) -> Result<Option<ScoreMap>, MetricError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    // =========================================================================
    // NaN guard and arg-max
    // =========================================================================

    #[test]
    fn test_nan_in_scores_rejected_for_every_configuration() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let outputs = ModelOutputs::ClassScores(vec![vec![0.1, 0.9], vec![f64::NAN, 0.2]]);
        let references: Vec<LabelValue> = vec![LabelValue::Id(0), LabelValue::Id(1)];

        for id in ["accuracy", "f1", "matthews_correlation"] {
            let metrics = vec![metric(id, id, id)];
            let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
            assert_eq!(
                engine.compute(&outputs, &references),
                Err(MetricError::NanOutput(1))
            );
        }
    }

    #[test]
    fn test_nan_checked_before_backends_run() {
        let labels = labels();
        let fixed = Fixed::new(None);
        let mut registry = MetricRegistry::new();
        registry.register("fixed", fixed.clone());
        let metrics = vec![metric("m", "fixed", "m")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::ClassScores(vec![vec![f64::NAN]]);
        assert!(engine.compute(&outputs, &[LabelValue::Id(0)]).is_err());
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_argmax_ties_to_lowest_index() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), Some(1));
        assert_eq!(argmax(&[-1.0, -3.0]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_class_scores_reduced_by_argmax() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let metrics = vec![metric("accuracy", "accuracy", "accuracy")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::ClassScores(vec![vec![0.1, 0.9], vec![0.8, 0.2]]);
        let result = engine.compute(&outputs, &[LabelValue::Id(1), LabelValue::Id(1)]).unwrap();
        assert_eq!(result["accuracy"], 0.5);
    }

    #[test]
    fn test_empty_score_row_rejected() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let metrics = vec![metric("accuracy", "accuracy", "accuracy")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::ClassScores(vec![vec![]]);
        assert_eq!(
            engine.compute(&outputs, &[LabelValue::Id(0)]),
            Err(MetricError::EmptyScores(0))
        );
    }

    // =========================================================================
    // Normalisation
    // =========================================================================

    #[test]
    fn test_normalize_strings_and_ids() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let engine = MetricAggregationEngine::new(&labels, &[], &registry).unwrap();
        let values: Vec<LabelValue> = vec!["POSITIV".into(), "negative".into(), LabelValue::Id(7)];
        assert_eq!(engine.normalize(&values).unwrap(), vec![1, 0, 7]);
    }

    #[test]
    fn test_unknown_label_is_fatal() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let engine = MetricAggregationEngine::new(&labels, &[], &registry).unwrap();
        assert_eq!(
            engine.normalize(&["mixed".into()]),
            Err(MetricError::UnknownLabel("mixed".to_string()))
        );
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let metrics = vec![metric("accuracy", "accuracy", "accuracy")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::Labels(vec!["positiv".into()]);
        assert!(matches!(
            engine.compute(&outputs, &[]),
            Err(MetricError::LengthMismatch { .. })
        ));
    }

    // =========================================================================
    // Result shaping
    // =========================================================================

    #[test]
    fn test_missing_result_omitted_not_zeroed() {
        let labels = labels();
        let mut registry = MetricRegistry::builtin();
        registry.register("silent", Fixed::new(None));
        let metrics = vec![
            metric("accuracy", "accuracy", "accuracy"),
            metric("silent", "silent", "score"),
        ];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::Labels(vec!["Positiv".into()]);
        let result = engine.compute(&outputs, &["positive".into()]).unwrap();
        assert_eq!(result.len(), 1);
        assert!(!result.contains_key("silent"));
        assert_eq!(result["accuracy"], 1.0);
    }

    #[test]
    fn test_non_coordinating_rank_yields_empty_result() {
        let labels = labels();
        let registry = MetricRegistry::builtin_for_rank(1);
        let metrics = vec![
            metric("accuracy", "accuracy", "accuracy"),
            metric("mcc", "matthews_correlation", "matthews_correlation"),
        ];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let outputs = ModelOutputs::Labels(vec![LabelValue::Id(0), LabelValue::Id(1)]);
        let result = engine.compute(&outputs, &[LabelValue::Id(0), LabelValue::Id(1)]).unwrap();
        assert!(result.is_empty());

        let coordinator = MetricRegistry::builtin_for_rank(0);
        let engine = MetricAggregationEngine::new(&labels, &metrics, &coordinator).unwrap();
        let result = engine.compute(&outputs, &[LabelValue::Id(0), LabelValue::Id(1)]).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_per_class_list_reduced_to_mean() {
        let labels = labels();
        let mut registry = MetricRegistry::new();
        registry.register(
            "per_class",
            Fixed::new(Some(ScoreMap::from([(
                "f1".to_string(),
                ScoreValue::PerClass(vec![0.2, 0.4, 0.9]),
            )]))),
        );
        let metrics = vec![metric("f1", "per_class", "f1")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let result = engine
            .compute(&ModelOutputs::Labels(vec![LabelValue::Id(0)]), &[LabelValue::Id(0)])
            .unwrap();
        assert!((result["f1"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_per_class_list_rejected() {
        assert_eq!(
            reduce("f1", &ScoreValue::PerClass(vec![])),
            Err(MetricError::EmptyPerClass("f1".to_string()))
        );
    }

    #[test]
    fn test_missing_results_key_rejected() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let metrics = vec![metric("accuracy", "accuracy", "acc")];
        let engine = MetricAggregationEngine::new(&labels, &metrics, &registry).unwrap();
        let result = engine.compute(&ModelOutputs::Labels(vec![LabelValue::Id(0)]), &[LabelValue::Id(0)]);
        assert!(matches!(result, Err(MetricError::MissingResultKey { .. })));
    }

    #[test]
    fn test_unknown_metric_rejected_at_construction() {
        let labels = labels();
        let registry = MetricRegistry::builtin();
        let metrics = vec![metric("bleu", "bleu", "bleu")];
        assert!(matches!(
            MetricAggregationEngine::new(&labels, &metrics, &registry),
            Err(MetricError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_registry_ids_sorted() {
        let registry = MetricRegistry::builtin();
        assert_eq!(
            registry.ids(),
            vec!["accuracy", "f1", "matthews_correlation", "precision", "recall"]
        );
        assert!(format!("{registry:?}").contains("accuracy"));
    }

    #[test]
    fn test_label_value_untagged_serde() {
        let values: Vec<LabelValue> = serde_json::from_str(r#"[1, "positiv"]"#).unwrap();
        assert_eq!(values, vec![LabelValue::Id(1), LabelValue::Label("positiv".to_string())]);
    }
}

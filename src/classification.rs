//! Built-in classification metric backends.
//!
//! Scores are computed from a confusion matrix over the sorted union of the
//! class ids present in predictions and references. Undefined ratios (no
//! predictions or no support for a class) count as 0.

use crate::config::ComputeArgs;
use crate::metrics::{MetricBackend, MetricError, ScoreMap, ScoreValue};
use std::collections::BTreeSet;

/// Averaging strategy for multi-class precision, recall and F1
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Average {
    /// Unweighted mean over classes
    Macro,
    /// Global counts of true positives, false positives and false negatives
    Micro,
    /// Mean weighted by class support
    Weighted,
    /// One score per class
    None,
}

impl Average {
    /// Read the `average` keyword argument, defaulting to macro
    ///
    /// # Errors
    ///
    /// Returns `MetricError::InvalidArgument` for an unknown strategy.
    pub fn from_args(args: &ComputeArgs) -> Result<Self, MetricError> {
        match args.get("average") {
            None => Ok(Self::Macro),
            Some(serde_json::Value::Null) => Ok(Self::None),
            Some(serde_json::Value::String(s)) => match s.to_lowercase().as_str() {
                "macro" => Ok(Self::Macro),
                "micro" => Ok(Self::Micro),
                "weighted" => Ok(Self::Weighted),
                "none" => Ok(Self::None),
                other => Err(MetricError::InvalidArgument(format!("average={other}"))),
            },
            Some(other) => Err(MetricError::InvalidArgument(format!("average={other}"))),
        }
    }
}

/// Confusion matrix over the class ids that actually occur
///
/// `matrix[t][p]` counts examples of class `labels[t]` predicted as `labels[p]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfusionMatrix {
    labels: Vec<usize>,
    matrix: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Build from equally long prediction and reference slices
    #[must_use]
    pub fn from_predictions(predictions: &[usize], references: &[usize]) -> Self {
        let labels: Vec<usize> = predictions
            .iter()
            .chain(references)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let position = |id: usize| labels.binary_search(&id).unwrap_or_default();

        let mut matrix = vec![vec![0; labels.len()]; labels.len()];
        for (&pred, &truth) in predictions.iter().zip(references) {
            matrix[position(truth)][position(pred)] += 1;
        }

        Self { labels, matrix }
    }

    /// Class ids, sorted
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Number of classes present
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }

    /// Count at `[true][predicted]` by matrix position
    #[must_use]
    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.matrix[truth][predicted]
    }

    /// True positives of the class at position `class`
    #[must_use]
    pub fn true_positives(&self, class: usize) -> usize {
        self.matrix[class][class]
    }

    /// Examples predicted as `class`
    #[must_use]
    pub fn predicted(&self, class: usize) -> usize {
        self.matrix.iter().map(|row| row[class]).sum()
    }

    /// Examples whose reference is `class`
    #[must_use]
    pub fn support(&self, class: usize) -> usize {
        self.matrix[class].iter().sum()
    }

    /// Total number of examples
    #[must_use]
    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    /// Fraction of correct predictions
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..self.n_classes()).map(|c| self.true_positives(c)).sum();
        correct as f64 / total as f64
    }

    /// Per-class precision, recall and F1
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn per_class(&self) -> PerClassScores {
        let n = self.n_classes();
        let mut scores = PerClassScores {
            precision: Vec::with_capacity(n),
            recall: Vec::with_capacity(n),
            f1: Vec::with_capacity(n),
            support: Vec::with_capacity(n),
        };

        for class in 0..n {
            let tp = self.true_positives(class) as f64;
            let predicted = self.predicted(class) as f64;
            let support = self.support(class);

            let p = ratio(tp, predicted);
            let r = ratio(tp, support as f64);
            scores.precision.push(p);
            scores.recall.push(r);
            scores.f1.push(harmonic_mean(p, r));
            scores.support.push(support);
        }

        scores
    }

    /// Multi-class Matthews correlation coefficient
    ///
    /// Returns 0 when either marginal distribution is constant.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
    pub fn matthews_correlation(&self) -> f64 {
        let n = self.n_classes();
        let s = self.total() as f64;
        let c: f64 = (0..n).map(|k| self.true_positives(k) as f64).sum();
        let p: Vec<f64> = (0..n).map(|k| self.predicted(k) as f64).collect();
        let t: Vec<f64> = (0..n).map(|k| self.support(k) as f64).collect();

        let p_dot_t: f64 = p.iter().zip(&t).map(|(pk, tk)| pk * tk).sum();
        let p_sq: f64 = p.iter().map(|pk| pk * pk).sum();
        let t_sq: f64 = t.iter().map(|tk| tk * tk).sum();

        let denominator = ((s * s - p_sq) * (s * s - t_sq)).sqrt();
        if denominator == 0.0 {
            return 0.0;
        }
        (c * s - p_dot_t) / denominator
    }
}

/// Per-class precision, recall, F1 and support
#[derive(Clone, Debug, PartialEq)]
pub struct PerClassScores {
    /// Precision per class
    pub precision: Vec<f64>,
    /// Recall per class
    pub recall: Vec<f64>,
    /// F1 per class
    pub f1: Vec<f64>,
    /// Reference count per class
    pub support: Vec<usize>,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn harmonic_mean(p: f64, r: f64) -> f64 {
    if p + r > 0.0 {
        2.0 * p * r / (p + r)
    } else {
        0.0
    }
}

/// Built-in metric implementations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinMetric {
    Accuracy,
    F1,
    Precision,
    Recall,
    MatthewsCorrelation,
}

impl BuiltinMetric {
    /// All built-in metrics
    pub const ALL: [Self; 5] = [
        Self::Accuracy,
        Self::F1,
        Self::Precision,
        Self::Recall,
        Self::MatthewsCorrelation,
    ];

    /// Registry identifier, also the key of the score it returns
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::F1 => "f1",
            Self::Precision => "precision",
            Self::Recall => "recall",
            Self::MatthewsCorrelation => "matthews_correlation",
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn averaged(cm: &ConfusionMatrix, per_class: &[f64], micro: f64, average: Average) -> ScoreValue {
        match average {
            Average::None => ScoreValue::PerClass(per_class.to_vec()),
            Average::Micro => ScoreValue::Scalar(micro),
            Average::Macro => {
                let mean = if per_class.is_empty() {
                    0.0
                } else {
                    per_class.iter().sum::<f64>() / per_class.len() as f64
                };
                ScoreValue::Scalar(mean)
            }
            Average::Weighted => {
                let total = cm.total();
                let weighted = if total == 0 {
                    0.0
                } else {
                    per_class
                        .iter()
                        .enumerate()
                        .map(|(class, v)| v * cm.support(class) as f64)
                        .sum::<f64>()
                        / total as f64
                };
                ScoreValue::Scalar(weighted)
            }
        }
    }
}

impl MetricBackend for BuiltinMetric {
    #[allow(clippy::cast_precision_loss)]
    fn compute(
        &self,
        predictions: &[usize],
        references: &[usize],
        kwargs: &ComputeArgs,
    ) -> Result<Option<ScoreMap>, MetricError> {
        let cm = ConfusionMatrix::from_predictions(predictions, references);

        let value = match self {
            Self::Accuracy => ScoreValue::Scalar(cm.accuracy()),
            Self::MatthewsCorrelation => ScoreValue::Scalar(cm.matthews_correlation()),
            Self::F1 | Self::Precision | Self::Recall => {
                let average = Average::from_args(kwargs)?;
                let per_class = cm.per_class();
                let tp: f64 = (0..cm.n_classes()).map(|c| cm.true_positives(c) as f64).sum();
                // single-label: global predicted count == global support == total
                let micro = ratio(tp, cm.total() as f64);
                let values = match self {
                    Self::F1 => &per_class.f1,
                    Self::Precision => &per_class.precision,
                    _ => &per_class.recall,
                };
                Self::averaged(&cm, values, micro, average)
            }
        };

        Ok(Some(ScoreMap::from([(self.id().to_string(), value)])))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn scalar(value: &ScoreValue) -> f64 {
        match value {
            ScoreValue::Scalar(v) => *v,
            ScoreValue::PerClass(_) => panic!("expected scalar"),
        }
    }

    fn compute(metric: BuiltinMetric, pred: &[usize], truth: &[usize], args: &ComputeArgs) -> ScoreValue {
        let scores = metric.compute(pred, truth, args).unwrap().unwrap();
        scores[metric.id()].clone()
    }

    fn average(value: serde_json::Value) -> ComputeArgs {
        ComputeArgs::from([("average".to_string(), value)])
    }

    // =========================================================================
    // Confusion matrix
    // =========================================================================

    #[test]
    fn test_confusion_matrix_counts() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1, 1, 2, 0], &[0, 1, 0, 2, 1]);
        assert_eq!(cm.labels(), &[0, 1, 2]);
        assert_eq!(cm.get(0, 0), 1);
        assert_eq!(cm.get(0, 1), 1);
        assert_eq!(cm.get(1, 0), 1);
        assert_eq!(cm.total(), 5);
        assert_eq!(cm.support(0), 2);
        assert_eq!(cm.predicted(1), 2);
        assert!((cm.accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_confusion_matrix_sparse_ids() {
        let cm = ConfusionMatrix::from_predictions(&[7, 3], &[3, 3]);
        assert_eq!(cm.labels(), &[3, 7]);
        assert_eq!(cm.get(0, 0), 1);
        assert_eq!(cm.get(0, 1), 1);
    }

    #[test]
    fn test_empty_confusion_matrix() {
        let cm = ConfusionMatrix::from_predictions(&[], &[]);
        assert_eq!(cm.n_classes(), 0);
        assert_eq!(cm.accuracy(), 0.0);
        assert_eq!(cm.matthews_correlation(), 0.0);
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    #[test]
    fn test_accuracy() {
        let args = ComputeArgs::new();
        let v = compute(BuiltinMetric::Accuracy, &[0, 1, 1, 0], &[0, 1, 0, 0], &args);
        assert!((scalar(&v) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_f1_macro_and_per_class() {
        // class 0: tp=1 fp=1 fn=1 -> p=.5 r=.5 f=.5
        // class 1: tp=1 fp=1 fn=0 -> p=.5 r=1 f=2/3
        // class 2: tp=1 fp=0 fn=1 -> p=1 r=.5 f=2/3
        let pred = [0, 1, 1, 2, 0];
        let truth = [0, 1, 0, 2, 2];
        let per_class = compute(BuiltinMetric::F1, &pred, &truth, &average(serde_json::Value::Null));
        let ScoreValue::PerClass(values) = per_class else {
            panic!("expected per-class scores");
        };
        assert_eq!(values.len(), 3);
        assert!((values[0] - 0.5).abs() < 1e-12);
        assert!((values[1] - 2.0 / 3.0).abs() < 1e-12);

        let macro_f1 = compute(BuiltinMetric::F1, &pred, &truth, &ComputeArgs::new());
        let expected = (0.5 + 2.0 / 3.0 + 2.0 / 3.0) / 3.0;
        assert!((scalar(&macro_f1) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_micro_equals_accuracy_for_single_label() {
        let pred = [0, 1, 1, 2, 0];
        let truth = [0, 1, 0, 2, 2];
        let micro = compute(BuiltinMetric::Precision, &pred, &truth, &average("micro".into()));
        assert!((scalar(&micro) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_recall() {
        let pred = [0, 0, 0, 1];
        let truth = [0, 0, 1, 1];
        // recall class 0 = 1.0 (support 2), class 1 = 0.5 (support 2)
        let v = compute(BuiltinMetric::Recall, &pred, &truth, &average("weighted".into()));
        assert!((scalar(&v) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_average_rejected() {
        let result = BuiltinMetric::F1.compute(&[0], &[0], &average("harmonic".into()));
        assert!(matches!(result, Err(MetricError::InvalidArgument(_))));
        let result = BuiltinMetric::F1.compute(&[0], &[0], &average(serde_json::json!(3)));
        assert!(matches!(result, Err(MetricError::InvalidArgument(_))));
    }

    #[test]
    fn test_mcc_perfect_and_inverse() {
        let args = ComputeArgs::new();
        let perfect = compute(BuiltinMetric::MatthewsCorrelation, &[0, 1, 0, 1], &[0, 1, 0, 1], &args);
        assert!((scalar(&perfect) - 1.0).abs() < 1e-12);
        let inverse = compute(BuiltinMetric::MatthewsCorrelation, &[1, 0, 1, 0], &[0, 1, 0, 1], &args);
        assert!((scalar(&inverse) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mcc_constant_prediction_is_zero() {
        let args = ComputeArgs::new();
        let v = compute(BuiltinMetric::MatthewsCorrelation, &[0, 0, 0], &[0, 1, 2], &args);
        assert_eq!(scalar(&v), 0.0);
    }

    #[test]
    fn test_builtin_ids_unique() {
        let ids: BTreeSet<&str> = BuiltinMetric::ALL.iter().map(|m| m.id()).collect();
        assert_eq!(ids.len(), BuiltinMetric::ALL.len());
    }
}

//! Aggregation of metric scores across evaluation iterations.
//!
//! A benchmark scores several bootstrapped iterations of the test split. Each
//! iteration yields one [`MetricResult`]; this module reduces them to a mean
//! with a Student's t confidence margin per metric.

use crate::metrics::MetricResult;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;

/// Statistical configuration for score aggregation
#[derive(Debug, Clone)]
pub struct StatConfig {
    /// Number of bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level (e.g., 0.95)
    pub confidence: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: 10_000,
            confidence: 0.95,
            seed: 4242,
        }
    }
}

/// Summary of one metric across iterations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSummary {
    /// Mean score
    pub mean: f64,
    /// Sample standard deviation
    pub std_dev: f64,
    /// Half-width of the confidence interval
    pub margin: f64,
    /// Lower bound of the confidence interval
    pub ci_lower: f64,
    /// Upper bound of the confidence interval
    pub ci_upper: f64,
    /// Percentile bootstrap interval of the mean; needs two iterations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<(f64, f64)>,
    /// Iterations that reported this metric
    pub iterations: usize,
}

impl ScoreSummary {
    /// Summarise raw per-iteration scores
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(samples: &[f64], config: &StatConfig) -> Self {
        let mean = compute_mean(samples);
        let std_dev = compute_std(samples);
        let margin = if samples.len() < 2 {
            0.0
        } else {
            t_critical(samples.len() - 1, config.confidence) * std_dev
                / (samples.len() as f64).sqrt()
        };

        Self {
            mean,
            std_dev,
            margin,
            ci_lower: mean - margin,
            ci_upper: mean + margin,
            bootstrap: bootstrap_ci(samples, config),
            iterations: samples.len(),
        }
    }
}

/// Aggregate per-iteration results into one summary per metric
///
/// Metrics absent from some iterations (e.g. omitted on a non-coordinating
/// process) are summarised over the iterations that report them.
#[must_use]
pub fn aggregate(results: &[MetricResult], config: &StatConfig) -> BTreeMap<String, ScoreSummary> {
    let mut samples: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for result in results {
        for (name, score) in result {
            samples.entry(name.as_str()).or_default().push(*score);
        }
    }

    samples
        .into_iter()
        .map(|(name, values)| (name.to_string(), ScoreSummary::from_samples(&values, config)))
        .collect()
}

/// Two-sided Student's t critical value
#[allow(clippy::cast_precision_loss)]
fn t_critical(degrees_of_freedom: usize, confidence: f64) -> f64 {
    StudentsT::new(0.0, 1.0, degrees_of_freedom as f64)
        .map(|t| t.inverse_cdf(1.0 - (1.0 - confidence) / 2.0))
        .unwrap_or(0.0)
}

#[allow(clippy::cast_precision_loss)]
fn compute_mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn compute_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = compute_mean(samples);
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Percentile bootstrap interval of the mean over iteration scores
///
/// Resamples the iterations with replacement `bootstrap_n` times from a
/// generator seeded with `config.seed`, so equal inputs give equal bounds.
/// Returns `None` with fewer than two samples or no resamples.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> Option<(f64, f64)> {
    if samples.len() < 2 || config.bootstrap_n == 0 {
        return None;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut means: Vec<f64> = (0..config.bootstrap_n)
        .map(|_| {
            let total: f64 = (0..samples.len())
                .map(|_| samples[rng.gen_range(0..samples.len())])
                .sum();
            total / samples.len() as f64
        })
        .collect();
    means.sort_by(f64::total_cmp);

    let tail = (1.0 - config.confidence) / 2.0;
    let last = means.len() - 1;
    let at = |q: f64| means[((q * last as f64).round() as usize).min(last)];
    Some((at(tail), at(1.0 - tail)))
}

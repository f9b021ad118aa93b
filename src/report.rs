//! Report generation for evaluation outcomes.
//!
//! Scores are shown as percentages with their confidence margin, followed by
//! the resolution diagnostics of the run.

use crate::config::DatasetConfig;
use crate::diagnostics::ResolutionStats;
use crate::runner::EvaluationOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Evaluation report for one model on one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// One row per metric
    pub metrics: Vec<MetricRow>,
    /// Raw per-iteration scores
    pub per_iteration: Vec<crate::metrics::MetricResult>,
    /// Resolution diagnostics
    pub stats: ResolutionStats,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Dataset name
    pub dataset: String,
    /// Language of the dataset prompts
    pub language: String,
    /// Evaluated model
    pub model_id: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Framework version
    pub framework_version: String,
    /// Number of evaluated iterations
    pub iterations: usize,
    /// Confidence level of the margins
    pub confidence: f64,
}

/// Summary of one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRow {
    /// Metric name
    pub name: String,
    /// Mean over iterations
    pub mean: f64,
    /// Confidence half-width
    pub margin: f64,
    /// Sample standard deviation
    pub std_dev: f64,
    /// Bootstrap interval of the mean, when at least two iterations ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<(f64, f64)>,
    /// Iterations reporting this metric
    pub iterations: usize,
}

impl ScoreReport {
    /// Build a report from an evaluation outcome
    #[must_use]
    pub fn new(
        dataset: &DatasetConfig,
        model_id: &str,
        outcome: &EvaluationOutcome,
        confidence: f64,
    ) -> Self {
        let metrics = outcome
            .summary
            .iter()
            .map(|(name, summary)| MetricRow {
                name: name.clone(),
                mean: summary.mean,
                margin: summary.margin,
                std_dev: summary.std_dev,
                bootstrap: summary.bootstrap,
                iterations: summary.iterations,
            })
            .collect();

        Self {
            metadata: ReportMetadata {
                dataset: dataset.name.clone(),
                language: dataset.language.clone(),
                model_id: model_id.to_string(),
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                iterations: outcome.per_iteration.len(),
                confidence,
            },
            metrics,
            per_iteration: outcome.per_iteration.clone(),
            stats: outcome.stats,
        }
    }

    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(
            output,
            "# {} on {}",
            self.metadata.model_id, self.metadata.dataset
        )
        .ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(
            output,
            "**Framework Version:** {}",
            self.metadata.framework_version
        )
        .ok();
        if !self.metadata.language.is_empty() {
            writeln!(output, "**Language:** {}", self.metadata.language).ok();
        }
        writeln!(output, "**Iterations:** {}", self.metadata.iterations).ok();
        writeln!(output).ok();

        writeln!(output, "## Scores").ok();
        writeln!(output).ok();
        let table = Table::new(self.score_rows()).with(Style::markdown()).to_string();
        writeln!(output, "{table}").ok();
        writeln!(output).ok();

        writeln!(output, "## Label Resolution").ok();
        writeln!(output).ok();
        writeln!(output, "| Condition | Count |").ok();
        writeln!(output, "|-----------|-------|").ok();
        for (condition, count) in self.stat_rows() {
            writeln!(output, "| {condition} | {count} |").ok();
        }

        output
    }

    /// Render report as a plain text table
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        writeln!(
            output,
            "{} on {} ({} iterations)",
            self.metadata.model_id, self.metadata.dataset, self.metadata.iterations
        )
        .ok();
        writeln!(output, "{}", Table::new(self.score_rows())).ok();
        let fallbacks = self.stats.fallbacks();
        if fallbacks > 0 {
            writeln!(output, "{fallbacks} predictions fell back to the default label").ok();
        }
        output
    }

    fn score_rows(&self) -> Vec<ScoreTableRow> {
        let level = self.metadata.confidence * 100.0;
        self.metrics
            .iter()
            .map(|row| ScoreTableRow {
                metric: row.name.clone(),
                score: format!("{:.2} ± {:.2}", row.mean * 100.0, row.margin * 100.0),
                interval: format!(
                    "{level:.0}% [{:.2}, {:.2}]",
                    (row.mean - row.margin) * 100.0,
                    (row.mean + row.margin) * 100.0
                ),
                bootstrap: row.bootstrap.map_or_else(
                    || "-".to_string(),
                    |(lower, upper)| format!("[{:.2}, {:.2}]", lower * 100.0, upper * 100.0),
                ),
                iterations: row.iterations,
            })
            .collect()
    }

    fn stat_rows(&self) -> [(&'static str, usize); 5] {
        [
            ("Resolved", self.stats.resolved),
            ("Empty outputs", self.stats.empty_outputs),
            ("Unmatched", self.stats.unmatched),
            ("Ambiguous", self.stats.ambiguous),
            ("Truncated", self.stats.truncated),
        ]
    }
}

/// Table row for text/markdown output
#[derive(Tabled)]
struct ScoreTableRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "Bootstrap")]
    bootstrap: String,
    #[tabled(rename = "Iterations")]
    iterations: usize,
}

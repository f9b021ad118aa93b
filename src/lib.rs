//! # Classify-Eval
//!
//! Label resolution and metric aggregation for language-model classification
//! benchmarks.
//!
//! A generative model answering a classification prompt produces free text or
//! ranked next-token candidates, not a class. This crate maps each generation
//! onto one of the dataset's candidate labels and scores the resulting
//! predictions with configurable metrics.
//!
//! ## Architecture
//!
//! ```text
//! GenerationOutput
//!        ↓
//! LabelResolutionDispatcher
//!   ├─ logprobs → LogprobLabelResolver (prefix matching)
//!   └─ text     → RawPredictionExtractor → EditDistanceLabelResolver
//!        ↓
//! class ids
//!        ↓
//! MetricAggregationEngine (NaN guard, arg-max, label lookup, backends)
//!        ↓
//! MetricResult per iteration
//!        ↓
//! scores::aggregate (mean ± t-based margin)
//!        ↓
//! ScoreReport (JSON, markdown, text)
//! ```
//!
//! Resolution never fails on odd model output: empty or unmatched generations
//! fall back to the first label and are counted in a per-run
//! [`ResolutionLog`]. Metric computation is strict and returns errors for NaN
//! scores or unknown labels.

pub mod classification;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod edit_distance;
pub mod extract;
pub mod labels;
pub mod logprobs;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod scores;

pub use classification::{Average, BuiltinMetric, ConfusionMatrix, PerClassScores};
pub use config::{
    ComputeArgs, ConfigError, DatasetConfig, DatasetLoader, MetricConfig, TaskConfig,
};
pub use diagnostics::{ResolutionLog, ResolutionStats};
pub use dispatch::{DispatchError, GenerationOutput, LabelResolutionDispatcher};
pub use edit_distance::{levenshtein, EditDistanceLabelResolver};
pub use extract::{RawPredictionExtractor, SpecialTokens, StopSequences, TokenDecoder};
pub use labels::{CandidateLabelSet, LabelError, LabelSpace};
pub use logprobs::{clean_token, LogprobLabelResolver, PrefixState, StepLogprobs, TokenLogprob};
pub use metrics::{
    raise_if_nan, CoordinatorOnly, LabelValue, MetricAggregationEngine, MetricBackend,
    MetricError, MetricRegistry, MetricResult, ModelOutputs, ScoreMap, ScoreValue,
};
pub use report::{MetricRow, ReportMetadata, ScoreReport};
pub use runner::{
    load_records, EvalRunner, EvaluationOutcome, GenerationRecord, RunnerError,
};
pub use scores::{aggregate, bootstrap_ci, ScoreSummary, StatConfig};

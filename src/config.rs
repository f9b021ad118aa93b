//! Configuration module for datasets and their metric tasks.
//!
//! Handles YAML dataset configuration loading with validation of the label
//! mapping and the metric list.

use crate::labels::{CandidateLabelSet, LabelError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid glob pattern: {0}")]
    GlobError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Duplicate metric name: {0}")]
    DuplicateMetric(String),

    #[error("Invalid label mapping: {0}")]
    InvalidLabels(#[from] LabelError),
}

/// Extra keyword arguments handed to a metric backend
pub type ComputeArgs = BTreeMap<String, serde_json::Value>;

/// A single metric the task is scored with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricConfig {
    /// Name used as key in the result mapping
    pub name: String,
    /// Identifier of the metric implementation in the registry
    pub metric_id: String,
    /// Key to read from the metric's score mapping
    pub results_key: String,
    /// Extra arguments passed to the metric computation
    #[serde(default)]
    pub compute_kwargs: ComputeArgs,
}

/// Task section of a dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Task identifier
    pub name: String,
    /// Ordered list of metrics
    pub metrics: Vec<MetricConfig>,
}

/// Dataset configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetConfig {
    /// Dataset identifier
    pub name: String,
    /// Language code of the prompts, carried into report metadata
    #[serde(default)]
    pub language: String,
    /// Canonical English labels, indexed by class id
    pub id2label: Vec<String>,
    /// Canonical English label to the label shown in the localized prompt
    pub prompt_label_mapping: HashMap<String, String>,
    /// Number of few-shot exemplars in each prompt
    #[serde(default)]
    pub num_few_shot_examples: usize,
    /// Whether the prompt carries an instruction paragraph before the example
    #[serde(default)]
    pub prompt_instruction_infix: bool,
    /// Generation budget per example, for the backend that produced the
    /// records; reported by `classify-eval validate`
    #[serde(default = "default_max_generated_tokens")]
    pub max_generated_tokens: usize,
    /// Metric task definition
    pub task: TaskConfig,
}

const fn default_max_generated_tokens() -> usize {
    5
}

impl DatasetConfig {
    /// Load dataset configuration from YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load dataset configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Build the candidate label set for this dataset
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidLabels` if `prompt_label_mapping` is not a
    /// bijection over `id2label`.
    pub fn candidate_labels(&self) -> Result<CandidateLabelSet, ConfigError> {
        Ok(CandidateLabelSet::new(
            &self.id2label,
            &self.prompt_label_mapping,
        )?)
    }

    /// Validate labels and metric definitions, returning the label set
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid label mapping, an incomplete metric
    /// definition, or a repeated metric name.
    pub fn validate(&self) -> Result<CandidateLabelSet, ConfigError> {
        let labels = self.candidate_labels()?;

        if self.task.metrics.is_empty() {
            return Err(ConfigError::MissingField("task.metrics".to_string()));
        }

        let mut names = HashSet::new();
        for metric in &self.task.metrics {
            if metric.name.is_empty() {
                return Err(ConfigError::MissingField("task.metrics[].name".to_string()));
            }
            if metric.metric_id.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "task.metrics[{}].metric_id",
                    metric.name
                )));
            }
            if metric.results_key.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "task.metrics[{}].results_key",
                    metric.name
                )));
            }
            if !names.insert(metric.name.as_str()) {
                return Err(ConfigError::DuplicateMetric(metric.name.clone()));
            }
        }

        Ok(labels)
    }
}

/// Loader for multiple dataset configurations from glob patterns
pub struct DatasetLoader {
    datasets: Vec<DatasetConfig>,
}

impl DatasetLoader {
    /// Create a new empty loader
    #[must_use]
    pub const fn new() -> Self {
        Self {
            datasets: Vec::new(),
        }
    }

    /// Load datasets from a glob pattern (e.g., "datasets/*.yaml")
    ///
    /// # Errors
    ///
    /// Returns an error if the glob pattern is invalid or files cannot be loaded.
    pub fn load_glob(pattern: &str) -> Result<Self, ConfigError> {
        let mut loader = Self::new();

        let paths = glob::glob(pattern).map_err(|e| ConfigError::GlobError(e.to_string()))?;

        for entry in paths {
            let path = entry.map_err(|e| ConfigError::GlobError(e.to_string()))?;
            loader.datasets.push(DatasetConfig::load(&path)?);
        }

        Ok(loader)
    }

    /// Load a single dataset from a file path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = DatasetConfig::load(path)?;
        Ok(Self {
            datasets: vec![config],
        })
    }

    /// Get all loaded datasets
    #[must_use]
    pub fn datasets(&self) -> &[DatasetConfig] {
        &self.datasets
    }

    /// Get the number of loaded datasets
    #[must_use]
    pub const fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Check if no datasets are loaded
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Iterate over loaded datasets
    pub fn iter(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter()
    }
}

impl Default for DatasetLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoIterator for DatasetLoader {
    type Item = DatasetConfig;
    type IntoIter = std::vec::IntoIter<DatasetConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.into_iter()
    }
}

//! Candidate label universe for a dataset.
//!
//! A dataset names each class by a canonical English label and shows the model
//! a localized label in the prompt. Generated text may match either, so the
//! candidate universe is the union of both, lower-cased:
//!
//! ```text
//! universe = [localized_0, ..., localized_n, canonical_0, ..., canonical_n]
//! ```
//!
//! Every candidate string maps back to exactly one class id. The structure is
//! built once per dataset and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised when a label mapping is not a bijection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("Dataset defines no labels")]
    NoLabels,

    #[error("Duplicate canonical label: {0}")]
    DuplicateLabel(String),

    #[error("Canonical label has no localized prompt label: {0}")]
    MissingPromptLabel(String),

    #[error("Prompt label mapping names unknown canonical label: {0}")]
    UnknownLabel(String),

    #[error("Localized label {localized:?} is shared by {first:?} and {second:?}")]
    SharedPromptLabel {
        localized: String,
        first: String,
        second: String,
    },

    #[error("Candidate {0:?} maps to more than one class")]
    CandidateCollision(String),

    #[error("No candidate labels supplied")]
    EmptyCandidates,
}

/// Which namespace resolved labels are reported in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelSpace {
    /// Lower-cased canonical English label
    #[default]
    Canonical,
    /// Label as written in the localized prompt
    Localized,
}

impl std::str::FromStr for LabelSpace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "canonical" | "english" => Ok(Self::Canonical),
            "localized" | "localised" | "prompt" => Ok(Self::Localized),
            other => Err(format!("unknown label space: {other}")),
        }
    }
}

/// Immutable two-way lookup between candidate strings and class ids
#[derive(Debug, Clone)]
pub struct CandidateLabelSet {
    /// Canonical labels by class id, lower-cased
    canonical: Vec<String>,
    /// Localized labels by class id, casing as configured
    localized: Vec<String>,
    /// Matching universe: localized then canonical, lower-cased
    universe: Vec<String>,
    /// Class id of each universe entry
    universe_class: Vec<usize>,
    /// Lower-cased candidate string to class id
    class_of: HashMap<String, usize>,
}

impl CandidateLabelSet {
    /// Build the candidate set from `id2label` and `prompt_label_mapping`
    ///
    /// # Errors
    ///
    /// Returns a `LabelError` when the mapping is not a bijection between the
    /// canonical labels and their localized counterparts.
    pub fn new(
        id2label: &[String],
        prompt_label_mapping: &HashMap<String, String>,
    ) -> Result<Self, LabelError> {
        if id2label.is_empty() {
            return Err(LabelError::NoLabels);
        }

        let mapping: HashMap<String, &String> = prompt_label_mapping
            .iter()
            .map(|(english, local)| (english.to_lowercase(), local))
            .collect();

        let mut canonical = Vec::with_capacity(id2label.len());
        let mut localized = Vec::with_capacity(id2label.len());
        for label in id2label {
            let key = label.to_lowercase();
            if canonical.contains(&key) {
                return Err(LabelError::DuplicateLabel(label.clone()));
            }
            let local = mapping
                .get(&key)
                .ok_or_else(|| LabelError::MissingPromptLabel(label.clone()))?;
            canonical.push(key);
            localized.push((*local).clone());
        }

        if let Some(unknown) = mapping.keys().find(|key| !canonical.contains(key)) {
            return Err(LabelError::UnknownLabel(unknown.clone()));
        }

        let mut universe = Vec::with_capacity(canonical.len() * 2);
        let mut universe_class = Vec::with_capacity(canonical.len() * 2);
        let mut class_of: HashMap<String, usize> = HashMap::new();

        for (id, local) in localized.iter().enumerate() {
            let key = local.to_lowercase();
            if let Some(&other) = class_of.get(&key) {
                return Err(LabelError::SharedPromptLabel {
                    localized: local.clone(),
                    first: canonical[other].clone(),
                    second: canonical[id].clone(),
                });
            }
            class_of.insert(key.clone(), id);
            universe.push(key);
            universe_class.push(id);
        }

        for (id, english) in canonical.iter().enumerate() {
            match class_of.get(english) {
                Some(&other) if other != id => {
                    return Err(LabelError::CandidateCollision(english.clone()));
                }
                _ => {
                    class_of.insert(english.clone(), id);
                }
            }
            universe.push(english.clone());
            universe_class.push(id);
        }

        Ok(Self {
            canonical,
            localized,
            universe,
            universe_class,
            class_of,
        })
    }

    /// Number of classes
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.canonical.len()
    }

    /// Full matching universe, localized labels first
    #[must_use]
    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    /// Canonical labels in class id order
    #[must_use]
    pub fn canonical_labels(&self) -> &[String] {
        &self.canonical
    }

    /// Localized labels in class id order
    #[must_use]
    pub fn localized_labels(&self) -> &[String] {
        &self.localized
    }

    /// Class id of the first universe entry, used as the fallback label
    #[must_use]
    pub fn fallback_class(&self) -> usize {
        self.universe_class[0]
    }

    /// Class id for any candidate string, ignoring case
    #[must_use]
    pub fn class_of(&self, candidate: &str) -> Option<usize> {
        self.class_of.get(&candidate.to_lowercase()).copied()
    }

    /// Label of a class in the requested space
    ///
    /// Returns `None` for an out-of-range class id.
    #[must_use]
    pub fn label(&self, class_id: usize, space: LabelSpace) -> Option<&str> {
        match space {
            LabelSpace::Canonical => self.canonical.get(class_id),
            LabelSpace::Localized => self.localized.get(class_id),
        }
        .map(String::as_str)
    }

    /// Distinct classes whose candidates start with `probe`, in universe order
    ///
    /// `probe` is expected lower-cased already.
    #[must_use]
    pub fn classes_with_prefix(&self, probe: &str) -> Vec<usize> {
        let mut classes = Vec::new();
        for (candidate, &class_id) in self.universe.iter().zip(&self.universe_class) {
            if candidate.starts_with(probe) && !classes.contains(&class_id) {
                classes.push(class_id);
            }
        }
        classes
    }
}

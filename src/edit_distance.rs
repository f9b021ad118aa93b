//! Label resolution by nearest edit distance.
//!
//! Used when the generation backend returns decoded text without scores. The
//! extracted answer span is compared with every candidate label and the closest
//! one wins; ties go to the candidate listed first.

use crate::labels::LabelError;

/// Character-level Levenshtein distance
///
/// Counts single-character insertions, deletions and substitutions. Operates
/// on Unicode scalar values, not bytes.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two-row dynamic programming table
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1) // deletion
                .min(curr[j] + 1) // insertion
                .min(prev[j] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Resolves decoded text to the closest candidate label
#[derive(Debug, Clone)]
pub struct EditDistanceLabelResolver {
    candidates: Vec<String>,
    folded: Vec<String>,
}

impl EditDistanceLabelResolver {
    /// Create a resolver over one namespace of candidate labels
    ///
    /// # Errors
    ///
    /// Returns `LabelError::EmptyCandidates` if no candidates are given.
    pub fn new<I, S>(candidates: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates: Vec<String> = candidates.into_iter().map(Into::into).collect();
        if candidates.is_empty() {
            return Err(LabelError::EmptyCandidates);
        }
        let folded = candidates.iter().map(|c| c.to_lowercase()).collect();
        Ok(Self { candidates, folded })
    }

    /// Candidate labels in configured order
    #[must_use]
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Index of the closest candidate to `text`
    #[must_use]
    pub fn closest_index(&self, text: &str) -> usize {
        let text = text.to_lowercase();
        let mut best = 0;
        let mut best_distance = usize::MAX;
        for (index, candidate) in self.folded.iter().enumerate() {
            let distance = levenshtein(&text, candidate);
            if distance < best_distance {
                best = index;
                best_distance = distance;
            }
        }
        best
    }

    /// Closest candidate label to `text`, as configured
    #[must_use]
    pub fn resolve(&self, text: &str) -> &str {
        &self.candidates[self.closest_index(text)]
    }

    /// Resolve every decoded string of a batch
    #[must_use]
    pub fn resolve_batch<S: AsRef<str>>(&self, texts: &[S]) -> Vec<String> {
        texts
            .iter()
            .map(|text| self.resolve(text.as_ref()).to_string())
            .collect()
    }
}

//! Evidence triplets recorded during ToG reasoning.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A `(subject, relation, object)` evidence record.
///
/// Equality and hashing ignore `confidence` and `source_step`, so the same
/// fact observed at different depths deduplicates into one triplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet {
    /// Subject entity name.
    pub subject: String,
    /// Relation label.
    pub relation: String,
    /// Object entity name.
    pub object: String,
    /// Confidence inherited from the traversed relation.
    pub confidence: f32,
    /// Traversal step that produced the triplet (`depth_1`, `depth_2`, ...).
    pub source_step: Option<String>,
}

impl Triplet {
    /// Creates a triplet.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation: relation.into(),
            object: object.into(),
            confidence: 1.0,
            source_step: None,
        }
    }

    /// Sets the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Records the producing step.
    #[must_use]
    pub fn with_source_step(mut self, step: impl Into<String>) -> Self {
        self.source_step = Some(step.into());
        self
    }
}

impl PartialEq for Triplet {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.relation == other.relation
            && self.object == other.object
    }
}

impl Eq for Triplet {}

impl Hash for Triplet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.subject.hash(state);
        self.relation.hash(state);
        self.object.hash(state);
    }
}

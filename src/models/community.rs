//! Community types produced by detection and summarization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative importance of a community, as judged by the summarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    /// Peripheral cluster.
    Low,
    /// Typical cluster.
    Medium,
    /// Central cluster for the corpus.
    High,
}

impl Significance {
    /// Returns the significance as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parses a significance level, defaulting unknown labels to `Medium`.
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured output of community summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunitySummary {
    /// Two-to-three sentence prose summary.
    pub summary: String,
    /// Three to five short theme labels.
    pub themes: Vec<String>,
    /// Judged importance.
    pub significance: Significance,
}

/// A cluster of related entities at one hierarchy level.
///
/// Every entity belongs to exactly one community per level; level 0 is the
/// finest partition. The summary fields stay empty until the summarizer
/// runs, and `stale` flips when underlying entities or relations change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    /// Community id, unique within a level.
    pub id: i64,
    /// Hierarchy depth, 0 = finest.
    pub level: u32,
    /// Number of member entities.
    pub size: usize,
    /// Prose summary, once generated.
    pub summary: Option<String>,
    /// Theme labels, once generated.
    pub themes: Vec<String>,
    /// Judged importance, once generated.
    pub significance: Option<Significance>,
    /// When the summary was generated (Unix seconds).
    pub summary_timestamp: Option<u64>,
    /// True when membership changed since the last summarization.
    pub stale: bool,
}

impl Community {
    /// Creates an unsummarized community.
    #[must_use]
    pub const fn new(id: i64, level: u32, size: usize) -> Self {
        Self {
            id,
            level,
            size,
            summary: None,
            themes: Vec::new(),
            significance: None,
            summary_timestamp: None,
            stale: false,
        }
    }

    /// Returns true if a summary has been generated and is current.
    #[must_use]
    pub const fn has_fresh_summary(&self) -> bool {
        self.summary.is_some() && !self.stale
    }

    /// Installs a generated summary.
    pub fn apply_summary(&mut self, summary: CommunitySummary) {
        self.summary = Some(summary.summary);
        self.themes = summary.themes;
        self.significance = Some(summary.significance);
        self.summary_timestamp = Some(crate::current_timestamp());
        self.stale = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance_parse_lossy() {
        assert_eq!(Significance::parse_lossy("HIGH"), Significance::High);
        assert_eq!(Significance::parse_lossy("low"), Significance::Low);
        assert_eq!(Significance::parse_lossy("whatever"), Significance::Medium);
    }

    #[test]
    fn test_apply_summary_clears_staleness() {
        let mut community = Community::new(7, 0, 12);
        community.stale = true;
        assert!(!community.has_fresh_summary());

        community.apply_summary(CommunitySummary {
            summary: "A cluster about finance.".to_string(),
            themes: vec!["banking".to_string(), "policy".to_string()],
            significance: Significance::High,
        });

        assert!(community.has_fresh_summary());
        assert_eq!(community.significance, Some(Significance::High));
        assert!(community.summary_timestamp.is_some());
    }
}

//! Community summarization.
//!
//! For each community the summarizer collects the most-mentioned members
//! and their internal relations, asks the model for a structured summary,
//! and stores it on the community with a timestamp. Batch mode isolates
//! per-community failures.

use crate::llm::prompts::build_community_summary_prompt;
use crate::llm::LlmGateway;
use crate::models::{CommunitySummary, Significance};
use crate::storage::GraphStore;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Members included in the summarization prompt.
const MAX_MEMBERS: usize = 20;

/// Internal relations included in the summarization prompt.
const MAX_RELATIONS: usize = 15;

/// Summarization temperature; mildly creative prose is fine here.
const SUMMARY_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    significance: String,
}

/// Batch summarization report.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SummarizationReport {
    /// Communities summarized this run.
    pub summarized: usize,
    /// Communities skipped because their summary was still fresh.
    pub skipped: usize,
    /// Communities whose summarization failed (isolated).
    pub failed: usize,
}

/// Generates and stores community summaries.
pub struct CommunitySummarizer {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
}

impl CommunitySummarizer {
    /// Creates a summarizer.
    #[must_use]
    pub const fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>) -> Self {
        Self { store, gateway }
    }

    /// Summarizes one community and stores the result.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown community; propagates gateway and
    /// storage failures.
    pub fn summarize(&self, community_id: i64, level: u32) -> Result<CommunitySummary> {
        let community = self
            .store
            .get_community(community_id, level)?
            .ok_or_else(|| Error::not_found("community", community_id.to_string()))?;

        let members = self.store.community_members(community_id, level)?;
        if members.is_empty() {
            return Err(Error::not_found("community", community_id.to_string()));
        }
        let top_members: Vec<_> = members.iter().take(MAX_MEMBERS).collect();

        let members_text = top_members
            .iter()
            .map(|m| {
                let description = if m.description.is_empty() {
                    "N/A"
                } else {
                    &m.description
                };
                format!("- {} ({}): {description}", m.name, m.kind)
            })
            .collect::<Vec<_>>()
            .join("\n");

        // Internal relations only: both endpoints inside the community.
        let member_ids: HashSet<_> = members.iter().map(|m| m.id.clone()).collect();
        let mut relations_text = Vec::new();
        let mut seen = HashSet::new();
        'outer: for member in &top_members {
            for relation in self.store.relations_of(&member.id)? {
                if !member_ids.contains(&relation.source) || !member_ids.contains(&relation.target)
                {
                    continue;
                }
                let key = (
                    relation.source.clone(),
                    relation.rel_type.clone(),
                    relation.target.clone(),
                );
                if !seen.insert(key) {
                    continue;
                }
                let source = members
                    .iter()
                    .find(|m| m.id == relation.source)
                    .map_or("?", |m| m.name.as_str());
                let target = members
                    .iter()
                    .find(|m| m.id == relation.target)
                    .map_or("?", |m| m.name.as_str());
                relations_text.push(format!(
                    "- {source} --{}--> {target}: {}",
                    relation.rel_type, relation.description
                ));
                if relations_text.len() >= MAX_RELATIONS {
                    break 'outer;
                }
            }
        }

        let prompt = build_community_summary_prompt(
            level,
            members.len(),
            &members_text,
            &relations_text.join("\n"),
        );
        let response: SummaryResponse =
            self.gateway
                .generate_json("community_summary", &prompt, SUMMARY_TEMPERATURE)?;

        let summary = CommunitySummary {
            summary: response.summary,
            themes: response.themes,
            significance: Significance::parse_lossy(&response.significance),
        };
        self.store
            .store_community_summary(community_id, level, &summary)?;
        tracing::debug!(community_id, level, "community summary stored");
        Ok(summary)
    }

    /// Summarizes every community at a level (default: all levels).
    ///
    /// Fresh summaries are skipped unless `force`; per-community failures
    /// are isolated and counted.
    ///
    /// # Errors
    ///
    /// Propagates storage failures listing the communities; summarization
    /// failures per community do not error.
    pub fn summarize_all(&self, level: Option<u32>, force: bool) -> Result<SummarizationReport> {
        let mut report = SummarizationReport::default();
        for community in self.store.list_communities(level)? {
            if community.has_fresh_summary() && !force {
                report.skipped += 1;
                continue;
            }
            match self.summarize(community.id, community.level) {
                Ok(_) => report.summarized += 1,
                Err(e) => {
                    tracing::warn!(
                        community = community.id,
                        level = community.level,
                        "community summarization failed: {e}"
                    );
                    report.failed += 1;
                },
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::LlmProvider;
    use crate::models::{EntityKind, Relation, RelationType};
    use crate::storage::MemoryGraphStore;

    struct CannedLlm(String);

    impl LlmProvider for CannedLlm {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            Ok(self.0.clone())
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(Vec::new())
        }
    }

    fn gateway(response: &str) -> Arc<LlmGateway> {
        let config = LlmConfig {
            rate_limit_interval_ms: 0,
            retry_backoff_ms: 1,
            ..LlmConfig::default()
        };
        Arc::new(LlmGateway::new(
            Arc::new(CannedLlm(response.to_string())),
            &config,
        ))
    }

    #[test]
    fn test_summarize_stores_result() {
        let store = Arc::new(MemoryGraphStore::new());
        let a = store
            .upsert_entity("Acme", EntityKind::Organization, "a company", 1.0, None)
            .unwrap();
        let b = store
            .upsert_entity("Paris", EntityKind::Geo, "a city", 1.0, None)
            .unwrap();
        store
            .upsert_relation(&Relation::new(
                a.clone(),
                b,
                RelationType::new("LOCATED_IN"),
            ))
            .unwrap();
        store.assign_communities(&[(a.clone(), 0)], 0).unwrap();

        let summarizer = CommunitySummarizer::new(
            store.clone(),
            gateway(
                r#"{"summary": "A corporate cluster.", "themes": ["business", "geography", "industry"], "significance": "high"}"#,
            ),
        );
        let summary = summarizer.summarize(0, 0).unwrap();
        assert_eq!(summary.significance, Significance::High);
        assert_eq!(summary.themes.len(), 3);

        let community = store.get_community(0, 0).unwrap().unwrap();
        assert!(community.has_fresh_summary());
    }

    #[test]
    fn test_summarize_all_skips_fresh() {
        let store = Arc::new(MemoryGraphStore::new());
        let a = store
            .upsert_entity("Acme", EntityKind::Organization, "", 1.0, None)
            .unwrap();
        store.assign_communities(&[(a, 0)], 0).unwrap();

        let summarizer = CommunitySummarizer::new(
            store,
            gateway(r#"{"summary": "s", "themes": ["t"], "significance": "low"}"#),
        );
        let first = summarizer.summarize_all(Some(0), false).unwrap();
        assert_eq!(first.summarized, 1);

        let second = summarizer.summarize_all(Some(0), false).unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.summarized, 0);
    }

    #[test]
    fn test_unknown_community_is_not_found() {
        let store = Arc::new(MemoryGraphStore::new());
        let summarizer = CommunitySummarizer::new(store, gateway("{}"));
        let result = summarizer.summarize(99, 0);
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}

//! Context retrieval: scoped searches rendered into a bounded text block

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result, StorageError};
use crate::router::{route, HookKind};
use crate::shard::{rank, Collection, MemoryKind, ScoredShard, Scope, ShardFilter};
use crate::storage::ShardStore;
use crate::trace::{self, TraceRef};

/// Rough characters per token used for every budget
pub const CHARS_PER_TOKEN: usize = 4;

/// Token budget for agents without a specific one
pub const DEFAULT_AGENT_TOKENS: usize = 1000;

/// Context token budget for an agent role
pub fn agent_token_budget(agent: &str) -> usize {
    match agent {
        "architect" => 1500,
        "analyst" | "pm" => 1200,
        "dev" | "tea" | "tech-writer" | "ux-designer" | "quick-flow-solo-dev" => 1000,
        "sm" => 800,
        _ => DEFAULT_AGENT_TOKENS,
    }
}

/// Character budget for an agent, unless the config fixes one
pub fn context_budget_chars(agent: &str, config: &Config) -> usize {
    config
        .context_budget_chars
        .unwrap_or_else(|| agent_token_budget(agent) * CHARS_PER_TOKEN)
}

/// Character budget manager for assembling a context block
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub limit: usize,
    pub used: usize,
}

impl ContextBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Whether `chars` more would stay within the limit
    pub fn fits(&self, chars: usize) -> bool {
        self.used + chars <= self.limit
    }

    pub fn add(&mut self, chars: usize) {
        self.used += chars;
    }

    /// Get remaining characters
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

/// One retrieved shard, ready to render
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    /// Provenance shown before the text
    pub label: String,
    pub text: String,
    pub score: f32,
}

impl ContextEntry {
    /// Label with the shard's in-text references, else the references of its
    /// narrative, else its kind
    pub fn from_scored(result: &ScoredShard) -> Self {
        let shard = &result.shard;
        let refs = trace::unique_strings(&trace::extract_refs(&shard.text));
        let label = if !refs.is_empty() {
            refs.join(", ")
        } else if !shard.metadata.trace_refs.is_empty() {
            shard.metadata.trace_refs.join(", ")
        } else {
            shard.metadata.kind.to_string()
        };

        Self {
            label,
            text: shard.text.clone(),
            score: result.score,
        }
    }

    pub fn render(&self) -> String {
        format!("[{}] {}", self.label, self.text)
    }
}

/// Header plus entries; rendered fresh for every retrieval
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub header: String,
    pub entries: Vec<ContextEntry>,
}

const SEPARATOR: &str = "\n\n";

impl ContextBlock {
    /// Render whole entries while they fit in `budget_chars`.
    ///
    /// When not even the first entry fits it is cut at the budget. Renders as
    /// the empty string when no part of any entry fits.
    pub fn render(&self, budget_chars: usize) -> String {
        if self.entries.is_empty() || budget_chars == 0 {
            return String::new();
        }

        let mut budget = ContextBudget::new(budget_chars);
        let mut out = String::new();
        if !self.header.is_empty() {
            out.push_str(&self.header);
            budget.add(self.header.chars().count());
        }

        let mut included = 0;
        for entry in &self.entries {
            let rendered = entry.render();
            let sep = if out.is_empty() { "" } else { SEPARATOR };
            let cost = sep.len() + rendered.chars().count();

            if budget.fits(cost) {
                out.push_str(sep);
                out.push_str(&rendered);
                budget.add(cost);
                included += 1;
                continue;
            }

            if included == 0 {
                let room = budget.remaining().saturating_sub(sep.len());
                if room > 0 {
                    out.push_str(sep);
                    out.push_str(truncate_chars(&rendered, room));
                    included += 1;
                }
            }
            break;
        }

        if included == 0 {
            return String::new();
        }
        out
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Drop low scores, rank, and drop shards whose references are already
/// covered by a higher-ranked shard.
pub fn rank_and_dedup(mut results: Vec<ScoredShard>, min_score: f32) -> Vec<ScoredShard> {
    results.retain(|r| r.score >= min_score);
    rank(&mut results);

    let mut seen: Vec<TraceRef> = Vec::new();
    let mut kept = Vec::with_capacity(results.len());
    for result in results {
        let refs = trace::extract_refs(&result.shard.text);
        if refs.iter().any(|r| seen.iter().any(|s| s.overlaps(r))) {
            debug!(id = %result.shard.id, "Dropped shard with covered reference");
            continue;
        }
        seen.extend(refs);
        kept.push(result);
    }
    kept
}

/// Story outcomes pulled into a story-start context
const STORY_OUTCOME_RESULTS: usize = 3;

/// Error patterns pulled into a story-start context
const ERROR_PATTERN_RESULTS: usize = 2;

/// One similarity search feeding a context block
#[derive(Debug, Clone)]
pub struct Search {
    pub collection: Collection,
    pub filter: ShardFilter,
    pub top_k: usize,
}

impl Search {
    pub fn new(collection: Collection, top_k: usize) -> Self {
        Self {
            collection,
            filter: ShardFilter::default(),
            top_k,
        }
    }

    pub fn filtered(mut self, filter: ShardFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// What to search for and how to label the rendered block
#[derive(Debug, Clone)]
pub struct ContextQuery {
    pub query: String,
    pub scope: Scope,
    pub searches: Vec<Search>,
    pub header: String,

    /// Overrides the configured minimum similarity
    pub min_score: Option<f32>,
}

impl ContextQuery {
    pub fn new(query: impl Into<String>, scope: Scope, header: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            scope,
            searches: Vec::new(),
            header: header.into(),
            min_score: None,
        }
    }

    pub fn search(mut self, search: Search) -> Self {
        self.searches.push(search);
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// Builds context blocks from scoped similarity searches
#[derive(Clone)]
pub struct ContextRetriever {
    store: Arc<ShardStore>,
    top_k: usize,
    min_score: f32,
    include_knowledge: bool,
    timeout: Duration,
    latency_warning: Duration,
}

impl ContextRetriever {
    pub fn new(store: Arc<ShardStore>, config: &Config) -> Self {
        Self {
            store,
            top_k: config.max_retrieval_results,
            min_score: config.min_similarity_score,
            include_knowledge: config.include_knowledge_in_context,
            timeout: config.retrieval_timeout,
            latency_warning: config.latency_warning,
        }
    }

    /// Results per collection when a caller has no specific limit
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Context for an agent about to start work on `feature`: its own
    /// memories, then recent story outcomes and error patterns.
    ///
    /// Empty when nothing relevant is stored or the retrieval timed out.
    pub async fn build_context(
        &self,
        agent: &str,
        group_id: &str,
        feature: &str,
        budget_chars: usize,
    ) -> Result<String> {
        let mut request = ContextQuery::new(
            feature,
            Scope::agent_group(agent, group_id),
            format!("## Prior memory for {} in {}", agent, group_id),
        )
        .search(Search::new(route(HookKind::StoryContext), self.top_k));

        if self.include_knowledge {
            let knowledge = route(HookKind::KnowledgeCapture);
            request = request
                .search(
                    Search::new(knowledge, STORY_OUTCOME_RESULTS)
                        .filtered(ShardFilter::kinds([MemoryKind::StoryOutcome])),
                )
                .search(
                    Search::new(knowledge, ERROR_PATTERN_RESULTS)
                        .filtered(ShardFilter::kinds([MemoryKind::ErrorPattern])),
                );
        }

        self.retrieve(&request, budget_chars).await
    }

    /// Run every search of `request` and render the results.
    ///
    /// A retrieval that outlives its time limit, or a storage call that
    /// times out underneath it, yields an empty context.
    pub async fn retrieve(&self, request: &ContextQuery, budget_chars: usize) -> Result<String> {
        let started = Instant::now();
        let results = match tokio::time::timeout(self.timeout, self.gather(request)).await {
            Ok(Ok(results)) => results,
            Ok(Err(Error::Storage(StorageError::Timeout { operation, limit }))) => {
                warn!(
                    operation,
                    timeout_ms = limit.as_millis() as u64,
                    "Storage timed out during context retrieval, returning empty context"
                );
                return Ok(String::new());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Context retrieval timed out, returning empty context"
                );
                return Ok(String::new());
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.latency_warning {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.latency_warning.as_millis() as u64,
                "Context retrieval was slow"
            );
        }

        let kept = rank_and_dedup(results, request.min_score.unwrap_or(self.min_score));

        let block = ContextBlock {
            header: request.header.clone(),
            entries: kept.iter().map(ContextEntry::from_scored).collect(),
        };
        let rendered = block.render(budget_chars);

        debug!(
            searches = request.searches.len(),
            entries = block.entries.len(),
            chars = rendered.chars().count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Built context"
        );
        Ok(rendered)
    }

    async fn gather(&self, request: &ContextQuery) -> Result<Vec<ScoredShard>> {
        let searches = request.searches.iter().map(|search| {
            self.store.search_filtered(
                search.collection,
                &request.query,
                &request.scope,
                &search.filter,
                search.top_k,
            )
        });
        let batches = try_join_all(searches).await?;
        Ok(batches.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Importance, MemoryKind, Shard, ShardDraft, ShardMetadata};
    use chrono::{TimeZone, Utc};

    fn scored(text: &str, score: f32) -> ScoredShard {
        ScoredShard {
            shard: Shard::from_draft(
                ShardDraft {
                    collection: Collection::Knowledge,
                    text: text.to_string(),
                    metadata: ShardMetadata::new(
                        "dev",
                        "proj",
                        MemoryKind::StoryOutcome,
                        Importance::High,
                        "story-1-outcome",
                        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
                    ),
                },
                Vec::new(),
            ),
            score,
        }
    }

    #[test]
    fn budgets_follow_agent_roles() {
        assert_eq!(agent_token_budget("architect"), 1500);
        assert_eq!(agent_token_budget("pm"), 1200);
        assert_eq!(agent_token_budget("sm"), 800);
        assert_eq!(agent_token_budget("someone-new"), DEFAULT_AGENT_TOKENS);

        let mut config = Config::with_data_dir("/tmp/unused");
        assert_eq!(context_budget_chars("dev", &config), 4000);
        config.context_budget_chars = Some(120);
        assert_eq!(context_budget_chars("dev", &config), 120);
    }

    #[test]
    fn dedup_drops_overlapping_references() {
        let kept = rank_and_dedup(
            vec![
                scored("later change to src/store.rs:10-20", 0.4),
                scored("built src/store.rs:1-15", 0.9),
                scored("unrelated src/api.rs:3", 0.5),
                scored("below threshold src/x.rs:1", 0.05),
            ],
            0.1,
        );

        let texts: Vec<_> = kept.iter().map(|r| r.shard.text.as_str()).collect();
        assert_eq!(texts, vec!["built src/store.rs:1-15", "unrelated src/api.rs:3"]);
    }

    #[test]
    fn entries_are_labelled_with_provenance() {
        let entry = ContextEntry::from_scored(&scored("see src/a.rs:4 and src/a.rs:4", 0.7));
        assert_eq!(entry.render(), "[src/a.rs:4] see src/a.rs:4 and src/a.rs:4");

        let mut inherited = scored("second half without refs", 0.7);
        inherited.shard.metadata.trace_refs = vec!["src/b.rs:1-9".to_string()];
        assert_eq!(ContextEntry::from_scored(&inherited).label, "src/b.rs:1-9");

        let mut chat = scored("use axum for the api", 0.7);
        chat.shard.metadata.kind = MemoryKind::ChatDecision;
        assert_eq!(ContextEntry::from_scored(&chat).label, "chat_decision");
    }

    #[test]
    fn render_keeps_whole_entries_within_budget() {
        let block = ContextBlock {
            header: "## H".to_string(),
            entries: vec![
                ContextEntry::from_scored(&scored("first src/a.rs:1", 0.9)),
                ContextEntry::from_scored(&scored("second src/b.rs:2", 0.8)),
            ],
        };

        let full = block.render(1000);
        assert_eq!(
            full,
            "## H\n\n[src/a.rs:1] first src/a.rs:1\n\n[src/b.rs:2] second src/b.rs:2"
        );

        let one = block.render(40);
        assert_eq!(one, "## H\n\n[src/a.rs:1] first src/a.rs:1");

        let cut = block.render(12);
        assert_eq!(cut.chars().count(), 12);
        assert!(cut.starts_with("## H\n\n[src"));
    }

    #[test]
    fn render_of_nothing_is_empty() {
        let block = ContextBlock {
            header: "## H".to_string(),
            entries: Vec::new(),
        };
        assert_eq!(block.render(500), "");
    }

    #[test]
    fn header_alone_is_not_a_context() {
        let block = ContextBlock {
            header: "## Prior memory for dev in proj".to_string(),
            entries: vec![ContextEntry::from_scored(&scored("first src/a.rs:1", 0.9))],
        };
        assert_eq!(block.render(10), "");
        assert_eq!(block.render(31), "");
        assert_eq!(block.render(32), "");
        assert!(block.render(34).ends_with("\n\n["));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}

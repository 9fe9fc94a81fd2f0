//! Lifecycle hooks called by the agent workflow
//!
//! Each hook is one self-contained call: validate, shard, route, store. Hooks
//! share nothing but the store, so concurrent calls from different agents do
//! not interfere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chunker::Chunker;
use crate::config::Config;
use crate::embedding::fnv1a;
use crate::error::{Result, ValidationError};
use crate::retrieval::{
    agent_token_budget, ContextQuery, ContextRetriever, Search, CHARS_PER_TOKEN,
};
use crate::router::{route, HookKind};
use crate::shard::{
    Importance, MemoryKind, ScoredShard, Scope, ShardDraft, ShardFilter, ShardId,
    ShardMetadata,
};
use crate::storage::ShardStore;
use crate::trace;

/// What a finished story reports to `after_story_complete`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryCompletion {
    pub story_id: String,
    pub epic_id: String,
    pub component: String,

    /// Must cite at least one `path:line` or `path:start-end`
    pub what_built: String,

    #[serde(default)]
    pub integration_points: Option<String>,

    /// Recorded as a separate error-pattern shard
    #[serde(default)]
    pub common_errors: Option<String>,

    #[serde(default)]
    pub testing: Option<String>,
}

impl StoryCompletion {
    pub fn new(
        story_id: impl Into<String>,
        epic_id: impl Into<String>,
        component: impl Into<String>,
        what_built: impl Into<String>,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            epic_id: epic_id.into(),
            component: component.into(),
            what_built: what_built.into(),
            ..Default::default()
        }
    }

    pub fn with_testing(mut self, testing: impl Into<String>) -> Self {
        self.testing = Some(testing.into());
        self
    }

    pub fn with_integration_points(mut self, points: impl Into<String>) -> Self {
        self.integration_points = Some(points.into());
        self
    }

    pub fn with_common_errors(mut self, errors: impl Into<String>) -> Self {
        self.common_errors = Some(errors.into());
        self
    }

    fn check_required(&self) -> std::result::Result<(), ValidationError> {
        require("story_id", &self.story_id)?;
        require("epic_id", &self.epic_id)?;
        require("component", &self.component)?;
        require("what_built", &self.what_built)?;
        Ok(())
    }

    fn outcome_narrative(&self) -> String {
        let mut narrative = format!("Story {}: {}", self.story_id, self.what_built.trim());
        if let Some(points) = non_blank(&self.integration_points) {
            narrative.push_str("\n\nIntegration: ");
            narrative.push_str(points);
        }
        if let Some(testing) = non_blank(&self.testing) {
            narrative.push_str("\n\nTesting: ");
            narrative.push_str(testing);
        }
        narrative
    }
}

fn require(field: &'static str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_length(
    field: &'static str,
    text: &str,
    max: usize,
) -> std::result::Result<(), ValidationError> {
    let len = text.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn day(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

fn minute(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M").to_string()
}

/// Prior decisions and fixes pulled before design or implementation work
const PRIOR_WORK_RESULTS: usize = 3;

fn short_hash(text: &str) -> String {
    format!("{:08x}", fnv1a(text.as_bytes()) as u32)
}

/// Hook façade for one agent in one work-group
#[derive(Clone)]
pub struct MemoryHooks {
    agent: String,
    group_id: String,
    best_practices_group: String,
    session_id: Option<String>,
    store: Arc<ShardStore>,
    retriever: ContextRetriever,
    chunker: Chunker,
    max_record_chars: usize,
    context_budget_chars: Option<usize>,
    architecture_min_score: f32,
}

impl MemoryHooks {
    /// Build hooks over an existing store without checking it
    pub fn new(agent: impl Into<String>, store: Arc<ShardStore>, config: &Config) -> Self {
        Self {
            agent: agent.into(),
            group_id: config.group_id.clone(),
            best_practices_group: config.best_practices_group.clone(),
            session_id: None,
            retriever: ContextRetriever::new(store.clone(), config),
            store,
            chunker: Chunker::new(config.max_shard_chars),
            max_record_chars: config.max_record_chars,
            context_budget_chars: config.context_budget_chars,
            architecture_min_score: config.architecture_min_score,
        }
    }

    /// Build hooks and fail fast unless all three collections exist
    pub async fn connect(
        agent: impl Into<String>,
        store: Arc<ShardStore>,
        config: &Config,
    ) -> Result<Self> {
        store.verify_collections().await?;
        Ok(Self::new(agent, store, config))
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Scope chat decisions to a conversation
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Characters of context this agent receives
    pub fn budget_chars(&self) -> usize {
        self.context_budget_chars
            .unwrap_or_else(|| agent_token_budget(&self.agent) * CHARS_PER_TOKEN)
    }

    fn scope(&self) -> Scope {
        match &self.session_id {
            Some(session) => Scope::Session(session.clone()),
            None => Scope::agent_group(&self.agent, &self.group_id),
        }
    }

    /// Prior memory relevant to `feature`; empty when there is none
    pub async fn before_story_start(&self, story_id: &str, feature: &str) -> Result<String> {
        require("feature", feature)?;

        let context = self
            .retriever
            .build_context(&self.agent, &self.group_id, feature, self.budget_chars())
            .await?;

        info!(
            agent = %self.agent,
            story_id,
            chars = context.chars().count(),
            "Loaded story context"
        );
        Ok(context)
    }

    /// Prior architecture decisions for `topic` anywhere in the work-group.
    /// Only close matches are returned.
    pub async fn before_architecture_decision(
        &self,
        topic: &str,
        technology: &str,
    ) -> Result<String> {
        require("topic", topic)?;
        require("technology", technology)?;

        let request = ContextQuery::new(
            format!("architecture {} {}", technology.trim(), topic.trim()),
            Scope::Group(self.group_id.clone()),
            "## Prior architecture decisions",
        )
        .search(
            Search::new(route(HookKind::ArchitectureDecision), PRIOR_WORK_RESULTS)
                .filtered(ShardFilter::kinds([MemoryKind::ArchitectureDecision])),
        )
        .min_score(self.architecture_min_score);

        self.retriever.retrieve(&request, self.budget_chars()).await
    }

    /// This agent's prior knowledge about `component`
    pub async fn before_implementation(&self, component: &str, feature: &str) -> Result<String> {
        require("component", component)?;
        require("feature", feature)?;

        let request = ContextQuery::new(
            format!("implementation {} {}", component.trim(), feature.trim()),
            Scope::agent_group(&self.agent, &self.group_id),
            format!("## Prior work on {}", component.trim()),
        )
        .search(
            Search::new(route(HookKind::KnowledgeCapture), PRIOR_WORK_RESULTS)
                .filtered(ShardFilter::default().with_component(component.trim())),
        );

        self.retriever.retrieve(&request, self.budget_chars()).await
    }

    /// Validate, shard and store what a story built. Returns the shard ids in
    /// write order.
    pub async fn after_story_complete(&self, completion: StoryCompletion) -> Result<Vec<ShardId>> {
        completion.check_required()?;
        let refs = trace::validate(&completion.what_built)?;

        let now = Utc::now();
        let collection = route(HookKind::KnowledgeCapture);

        let outcome = ShardMetadata::new(
            &self.agent,
            &self.group_id,
            MemoryKind::StoryOutcome,
            Importance::High,
            format!("story-{}-outcome-{}", completion.story_id, day(&now)),
            now,
        )
        .with_story(&completion.story_id, &completion.epic_id, &completion.component)
        .with_session(self.session_id.clone());

        let mut drafts = self
            .chunker
            .split(&completion.outcome_narrative(), collection, &outcome);

        if let Some(errors) = non_blank(&completion.common_errors) {
            let text = format!(
                "Story {} common errors in {}: {}\n\nReferences: {}",
                completion.story_id,
                completion.component,
                errors,
                trace::unique_strings(&refs).join(", ")
            );
            let mut error_meta = outcome.clone();
            error_meta.kind = MemoryKind::ErrorPattern;
            error_meta.importance = Importance::Medium;
            error_meta.unique_id = format!("error-{}-{}", completion.story_id, day(&now));
            drafts.extend(self.chunker.split(&text, collection, &error_meta));
        }

        let ids = self.store.store_all(drafts).await?;

        info!(
            agent = %self.agent,
            story_id = %completion.story_id,
            shards = ids.len(),
            "Stored story outcome"
        );
        Ok(ids)
    }

    /// Store an architecture decision. `decision` must cite the code it
    /// affects; breaking changes are stored as critical.
    pub async fn after_architecture_decision(
        &self,
        topic: &str,
        decision: &str,
        justification: &str,
        tradeoffs: &str,
        component: &str,
        breaking_change: bool,
    ) -> Result<ShardId> {
        require("topic", topic)?;
        require("decision", decision)?;
        require("justification", justification)?;
        require("tradeoffs", tradeoffs)?;
        require("component", component)?;
        let refs = trace::validate(decision)?;

        let text = format!(
            "Architecture decision: {}\nJustification: {}\nTrade-offs: {}",
            decision.trim(),
            justification.trim(),
            tradeoffs.trim()
        );
        check_length("architecture_decision", &text, self.max_record_chars)?;

        let now = Utc::now();
        let (importance, tags) = if breaking_change {
            (Importance::Critical, vec!["breaking_change".to_string()])
        } else {
            (Importance::High, Vec::new())
        };
        let metadata = ShardMetadata::new(
            &self.agent,
            &self.group_id,
            MemoryKind::ArchitectureDecision,
            importance,
            format!("arch-{}-{}", slug(topic), day(&now)),
            now,
        )
        .with_component(component.trim())
        .with_session(self.session_id.clone())
        .with_trace_refs(trace::unique_strings(&refs))
        .with_tags(tags);

        let id = self
            .store
            .store(ShardDraft {
                collection: route(HookKind::ArchitectureDecision),
                text,
                metadata,
            })
            .await?;

        info!(agent = %self.agent, topic, breaking_change, %id, "Stored architecture decision");
        Ok(id)
    }

    /// Store how a bug was fixed as an error pattern. `solution` must cite
    /// the fix.
    pub async fn after_bug_fix(
        &self,
        error: &str,
        root_cause: &str,
        solution: &str,
        prevention: &str,
        component: &str,
        story_id: Option<&str>,
    ) -> Result<ShardId> {
        require("error", error)?;
        require("root_cause", root_cause)?;
        require("solution", solution)?;
        require("prevention", prevention)?;
        require("component", component)?;
        let refs = trace::validate(solution)?;

        let text = format!(
            "Error: {}\nCause: {}\nSolution: {}\nPrevention: {}",
            error.trim(),
            root_cause.trim(),
            solution.trim(),
            prevention.trim()
        );
        check_length("bug_fix", &text, self.max_record_chars)?;

        let now = Utc::now();
        let mut metadata = ShardMetadata::new(
            &self.agent,
            &self.group_id,
            MemoryKind::ErrorPattern,
            Importance::Medium,
            format!("error-{}-{}", slug(component), minute(&now)),
            now,
        )
        .with_component(component.trim())
        .with_session(self.session_id.clone())
        .with_trace_refs(trace::unique_strings(&refs));
        metadata.story_id = story_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let id = self
            .store
            .store(ShardDraft {
                collection: route(HookKind::BugFix),
                text,
                metadata,
            })
            .await?;

        info!(agent = %self.agent, component, %id, "Stored bug fix");
        Ok(id)
    }

    /// Store one best practice in the shared group. Identical calls store
    /// two shards.
    pub async fn store_best_practice(
        &self,
        category: &str,
        pattern: &str,
        content: &str,
        evidence: &str,
    ) -> Result<ShardId> {
        require("category", category)?;
        require("pattern", pattern)?;
        require("content", content)?;
        require("evidence", evidence)?;

        let text = format!(
            "Best practice ({}): {}\n\n{}\n\nEvidence: {}",
            category.trim(),
            pattern.trim(),
            content.trim(),
            evidence.trim()
        );
        check_length("best_practice", &text, self.max_record_chars)?;

        let now = Utc::now();
        let refs = trace::unique_strings(&trace::extract_refs(&text));
        let metadata = ShardMetadata::new(
            &self.agent,
            &self.best_practices_group,
            MemoryKind::BestPractice,
            Importance::Medium,
            format!("bp-{}-{}-{}", slug(category), day(&now), short_hash(&text)),
            now,
        )
        .with_practice(category.trim(), pattern.trim())
        .with_session(self.session_id.clone())
        .with_trace_refs(refs);

        let id = self
            .store
            .store(ShardDraft {
                collection: route(HookKind::BestPractice),
                text,
                metadata,
            })
            .await?;

        info!(agent = %self.agent, category, %id, "Stored best practice");
        Ok(id)
    }

    /// Store a decision taken in conversation
    pub async fn store_chat_decision(
        &self,
        decision: &str,
        reasoning: &str,
        context: &str,
        importance: &str,
    ) -> Result<ShardId> {
        require("decision", decision)?;
        require("reasoning", reasoning)?;
        require("context", context)?;
        require("importance", importance)?;
        let importance: Importance = importance.parse()?;

        let text = format!(
            "Decision: {}\nReasoning: {}\nContext: {}",
            decision.trim(),
            reasoning.trim(),
            context.trim()
        );
        check_length("chat_decision", &text, self.max_record_chars)?;

        let now = Utc::now();
        let refs = trace::unique_strings(&trace::extract_refs(&text));
        let metadata = ShardMetadata::new(
            &self.agent,
            &self.group_id,
            MemoryKind::ChatDecision,
            importance,
            format!("chat-{}-{}-{}", slug(&self.agent), day(&now), short_hash(&text)),
            now,
        )
        .with_session(self.session_id.clone())
        .with_trace_refs(refs);

        let id = self
            .store
            .store(ShardDraft {
                collection: route(HookKind::ChatDecision),
                text,
                metadata,
            })
            .await?;

        info!(agent = %self.agent, %importance, %id, "Stored chat decision");
        Ok(id)
    }

    /// Prior chat decisions about `topic` for this session, or for this agent
    /// and group when no session is set
    pub async fn load_chat_context(&self, topic: &str) -> Result<String> {
        require("topic", topic)?;

        let request = ContextQuery::new(topic, self.scope(), "## Prior decisions").search(
            Search::new(route(HookKind::ChatDecision), self.retriever.top_k())
                .filtered(ShardFilter::kinds([MemoryKind::ChatDecision])),
        );
        self.retriever.retrieve(&request, self.budget_chars()).await
    }

    /// Knowledge in this work-group matching `filter`, best match first
    pub async fn search_knowledge(
        &self,
        query: &str,
        filter: &ShardFilter,
        limit: usize,
    ) -> Result<Vec<ScoredShard>> {
        require("query", query)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.store
            .search_filtered(
                route(HookKind::KnowledgeCapture),
                query,
                &Scope::Group(self.group_id.clone()),
                filter,
                limit,
            )
            .await
    }

    /// Best practices shared across projects, best match first
    pub async fn search_best_practices(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredShard>> {
        require("query", query)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.store
            .search(
                route(HookKind::BestPractice),
                query,
                &Scope::Group(self.best_practices_group.clone()),
                limit,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_narrative_appends_optional_sections() {
        let completion = StoryCompletion::new("2-23", "2", "storage", "Writer in src/w.rs:1-9")
            .with_integration_points("  ")
            .with_testing("cargo test storage");

        assert_eq!(
            completion.outcome_narrative(),
            "Story 2-23: Writer in src/w.rs:1-9\n\nTesting: cargo test storage"
        );
    }

    #[test]
    fn required_fields_are_named() {
        let completion = StoryCompletion::new("2-23", "", "storage", "src/w.rs:1");
        assert_eq!(
            completion.check_required(),
            Err(ValidationError::MissingField { field: "epic_id" })
        );
    }

    #[test]
    fn slugs_are_lowercase_and_dashed() {
        assert_eq!(slug("Error Handling / Retries"), "error-handling-retries");
        assert_eq!(slug("  api  "), "api");
    }

    #[test]
    fn length_limit_counts_chars() {
        assert!(check_length("content", "ééé", 3).is_ok());
        assert_eq!(
            check_length("content", "éééé", 3),
            Err(ValidationError::TooLong {
                field: "content",
                len: 4,
                max: 3
            })
        );
    }

    #[test]
    fn bug_fix_ids_carry_the_minute() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 1, 9, 7, 0).unwrap();
        assert_eq!(minute(&at), "202603010907");
        assert_eq!(day(&at), "20260301");
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("same"), short_hash("same"));
        assert_ne!(short_hash("same"), short_hash("other"));
        assert_eq!(short_hash("x").len(), 8);
    }
}

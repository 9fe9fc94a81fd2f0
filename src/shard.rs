//! Shard types: the immutable stored unit and its metadata

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Identifier assigned to a shard when it is written
pub type ShardId = Uuid;

/// The three fixed collections. Nothing else is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    /// Story outcomes and error patterns, always traceable
    Knowledge,

    /// Shared best practices
    BestPractices,

    /// Chat decisions and pre-story context
    AgentMemory,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Knowledge,
        Collection::BestPractices,
        Collection::AgentMemory,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Knowledge => "knowledge",
            Collection::BestPractices => "best-practices",
            Collection::AgentMemory => "agent-memory",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown collection `{}`", s))
    }
}

/// What a shard records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// What a finished story built
    StoryOutcome,

    /// Errors met while building a story
    ErrorPattern,

    /// A reusable practice with evidence
    BestPractice,

    /// A decision taken in conversation
    ChatDecision,

    /// An architecture decision with its trade-offs
    ArchitectureDecision,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::StoryOutcome => "story_outcome",
            MemoryKind::ErrorPattern => "error_pattern",
            MemoryKind::BestPractice => "best_practice",
            MemoryKind::ChatDecision => "chat_decision",
            MemoryKind::ArchitectureDecision => "architecture_decision",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Importance level of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Medium => "medium",
            Importance::High => "high",
            Importance::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Importance {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Importance::Low),
            "medium" => Ok(Importance::Medium),
            "high" => Ok(Importance::High),
            "critical" => Ok(Importance::Critical),
            _ => Err(ValidationError::InvalidImportance(s.to_string())),
        }
    }
}

/// Metadata attached to every shard. Fields that only apply to some
/// collections are optional and omitted from the payload when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Agent that produced the record
    pub agent: String,

    /// Work-group (project) the record belongs to
    pub group_id: String,

    /// What the shard records
    pub kind: MemoryKind,

    pub importance: Importance,

    /// Human-readable deterministic id, distinct from the storage id
    pub unique_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Traceability references of the parent narrative, verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace_refs: Vec<String>,

    /// Free-form markers such as `breaking_change`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Position among the shards cut from the same narrative
    #[serde(default)]
    pub shard_index: u32,

    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Supplied by the caller, never generated during chunking
    pub created_at: DateTime<Utc>,
}

fn default_shard_count() -> u32 {
    1
}

impl ShardMetadata {
    pub fn new(
        agent: impl Into<String>,
        group_id: impl Into<String>,
        kind: MemoryKind,
        importance: Importance,
        unique_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            agent: agent.into(),
            group_id: group_id.into(),
            kind,
            importance,
            unique_id: unique_id.into(),
            story_id: None,
            epic_id: None,
            component: None,
            session_id: None,
            category: None,
            pattern: None,
            trace_refs: Vec::new(),
            tags: Vec::new(),
            shard_index: 0,
            shard_count: 1,
            created_at,
        }
    }

    pub fn with_story(
        mut self,
        story_id: impl Into<String>,
        epic_id: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        self.story_id = Some(story_id.into());
        self.epic_id = Some(epic_id.into());
        self.component = Some(component.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_practice(
        mut self,
        category: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.category = Some(category.into());
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_trace_refs(mut self, refs: Vec<String>) -> Self {
        self.trace_refs = refs;
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// A shard that has not been written yet
#[derive(Debug, Clone, PartialEq)]
pub struct ShardDraft {
    pub collection: Collection,
    pub text: String,
    pub metadata: ShardMetadata,
}

/// A stored shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub collection: Collection,
    pub text: String,
    pub metadata: ShardMetadata,

    /// Embedding of `text`; not read back from every store
    #[serde(skip)]
    pub vector: Vec<f32>,
}

impl Shard {
    /// Assign an id and attach the embedding
    pub fn from_draft(draft: ShardDraft, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: draft.collection,
            text: draft.text,
            metadata: draft.metadata,
            vector,
        }
    }
}

/// Logical partition used to filter searches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One agent inside one work-group
    AgentGroup { agent: String, group_id: String },

    /// One chat session
    Session(String),

    /// Every agent of a work-group
    Group(String),
}

impl Scope {
    pub fn agent_group(agent: impl Into<String>, group_id: impl Into<String>) -> Self {
        Scope::AgentGroup {
            agent: agent.into(),
            group_id: group_id.into(),
        }
    }

    pub fn matches(&self, metadata: &ShardMetadata) -> bool {
        match self {
            Scope::AgentGroup { agent, group_id } => {
                metadata.agent == *agent && metadata.group_id == *group_id
            }
            Scope::Session(session_id) => metadata.session_id.as_deref() == Some(session_id),
            Scope::Group(group_id) => metadata.group_id == *group_id,
        }
    }
}

/// Metadata constraints applied on top of a [`Scope`]. Empty fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardFilter {
    /// Any of these kinds
    pub kinds: Vec<MemoryKind>,

    /// Any of these importance levels
    pub importance: Vec<Importance>,

    pub story_id: Option<String>,
    pub component: Option<String>,
}

impl ShardFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_importance(mut self, levels: impl IntoIterator<Item = Importance>) -> Self {
        self.importance = levels.into_iter().collect();
        self
    }

    pub fn with_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, metadata: &ShardMetadata) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&metadata.kind))
            && (self.importance.is_empty() || self.importance.contains(&metadata.importance))
            && self
                .story_id
                .as_ref()
                .map_or(true, |id| metadata.story_id.as_ref() == Some(id))
            && self
                .component
                .as_ref()
                .map_or(true, |c| metadata.component.as_ref() == Some(c))
    }
}

/// A shard returned by a similarity search
#[derive(Debug, Clone)]
pub struct ScoredShard {
    pub shard: Shard,
    pub score: f32,
}

/// Order by descending score, newer shards first on ties
pub fn rank(results: &mut [ScoredShard]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.shard.metadata.created_at.cmp(&a.shard.metadata.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata(agent: &str, group: &str) -> ShardMetadata {
        ShardMetadata::new(
            agent,
            group,
            MemoryKind::ChatDecision,
            Importance::Medium,
            "chat-dev-1",
            Utc.with_ymd_and_hms(2026, 1, 4, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn collection_names_round_trip() {
        for collection in Collection::ALL {
            assert_eq!(collection.name().parse::<Collection>().unwrap(), collection);
        }
        assert!("bmad-knowledge".parse::<Collection>().is_err());
    }

    #[test]
    fn importance_is_a_closed_set() {
        assert_eq!("HIGH".parse::<Importance>().unwrap(), Importance::High);
        assert_eq!(
            "urgent".parse::<Importance>(),
            Err(ValidationError::InvalidImportance("urgent".to_string()))
        );
    }

    #[test]
    fn scope_filters_on_metadata() {
        let meta = metadata("dev", "proj-a").with_session(Some("s-1".to_string()));

        assert!(Scope::agent_group("dev", "proj-a").matches(&meta));
        assert!(!Scope::agent_group("dev", "proj-b").matches(&meta));
        assert!(!Scope::agent_group("architect", "proj-a").matches(&meta));
        assert!(Scope::Session("s-1".to_string()).matches(&meta));
        assert!(!Scope::Session("s-2".to_string()).matches(&meta));
        assert!(Scope::Group("proj-a".to_string()).matches(&meta));
    }

    #[test]
    fn filter_narrows_by_kind_importance_and_ids() {
        let meta = metadata("dev", "proj-a").with_story("2-1", "2", "storage");

        assert!(ShardFilter::default().matches(&meta));
        assert!(ShardFilter::default().is_empty());
        assert!(ShardFilter::kinds([MemoryKind::ChatDecision, MemoryKind::StoryOutcome]).matches(&meta));
        assert!(!ShardFilter::kinds([MemoryKind::ErrorPattern]).matches(&meta));
        assert!(ShardFilter::default()
            .with_importance([Importance::Medium, Importance::High])
            .matches(&meta));
        assert!(!ShardFilter::default()
            .with_importance([Importance::Critical])
            .matches(&meta));
        assert!(ShardFilter::default().with_story("2-1").with_component("storage").matches(&meta));
        assert!(!ShardFilter::default().with_component("api").matches(&meta));
        assert!(!ShardFilter::default().with_story("2-1").matches(&metadata("dev", "proj-a")));
    }

    #[test]
    fn metadata_payload_omits_unset_fields() {
        let json = serde_json::to_value(metadata("dev", "proj-a")).unwrap();
        assert_eq!(json["kind"], "chat_decision");
        assert_eq!(json["importance"], "medium");
        assert!(json.get("story_id").is_none());
        assert!(json.get("trace_refs").is_none());
        assert!(json.get("tags").is_none());
    }

    #[test]
    fn rank_breaks_ties_by_recency() {
        let older = metadata("dev", "g");
        let mut newer = metadata("dev", "g");
        newer.created_at = older.created_at + chrono::Duration::minutes(5);

        let shard = |meta: ShardMetadata, text: &str| ScoredShard {
            shard: Shard::from_draft(
                ShardDraft {
                    collection: Collection::AgentMemory,
                    text: text.to_string(),
                    metadata: meta,
                },
                Vec::new(),
            ),
            score: 0.5,
        };

        let mut results = vec![shard(older, "old"), shard(newer, "new")];
        results.push(ScoredShard {
            score: 0.9,
            ..shard(metadata("dev", "g"), "best")
        });
        rank(&mut results);

        let order: Vec<_> = results.iter().map(|r| r.shard.text.as_str()).collect();
        assert_eq!(order, vec!["best", "new", "old"]);
    }
}

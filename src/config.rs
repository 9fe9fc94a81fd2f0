//! Configuration for story-memory

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which vector store the server should open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// LanceDB tables under `data_dir/vectors`
    Lance,
    /// Process-local store, lost on exit
    Memory,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lance" | "lancedb" => Ok(Self::Lance),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(Error::config(format!("unknown vector backend `{}`", other))),
        }
    }
}

/// Which embedder the server should load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    /// all-MiniLM-L6-v2 through fastembed
    FastEmbed,
    /// Token hashing, no model download
    Hash,
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fastembed" => Ok(Self::FastEmbed),
            "hash" => Ok(Self::Hash),
            other => Err(Error::config(format!("unknown embedder `{}`", other))),
        }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Vector store backend
    pub backend: BackendKind,

    /// Embedder used for shards and queries
    pub embedder: EmbedderKind,

    /// fastembed model name, see `FastEmbedder::new`
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Work-group that scopes knowledge and chat records
    pub group_id: String,

    /// Group shared by every project for best practices
    pub best_practices_group: String,

    /// Maximum characters in one chunked shard (~300 tokens)
    pub max_shard_chars: usize,

    /// Maximum characters in a single-record hook (best practice, chat decision)
    pub max_record_chars: usize,

    /// Maximum results fetched from each collection per retrieval
    pub max_retrieval_results: usize,

    /// Minimum similarity score kept by retrieval
    pub min_similarity_score: f32,

    /// Minimum similarity for prior architecture decisions
    pub architecture_min_score: f32,

    /// Whether `before_story_start` also searches the knowledge collection
    pub include_knowledge_in_context: bool,

    /// Fixed context budget; when unset the per-agent budget applies
    pub context_budget_chars: Option<usize>,

    /// Hard limit for one retrieval; exceeding it yields an empty context
    pub retrieval_timeout: Duration,

    /// Soft limit for one retrieval; exceeding it only logs a warning
    pub latency_warning: Duration,

    /// Limit for each embedding or vector-store call on the write path
    pub storage_timeout: Duration,

    /// Create missing collections at startup instead of failing
    pub create_collections: bool,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("story-memory");

        Self {
            data_dir,
            backend: BackendKind::Lance,
            embedder: EmbedderKind::FastEmbed,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384,
            group_id: "default-project".to_string(),
            best_practices_group: "universal".to_string(),
            max_shard_chars: 1200,
            max_record_chars: 4000,
            max_retrieval_results: 5,
            min_similarity_score: 0.0,
            architecture_min_score: 0.7,
            include_knowledge_in_context: true,
            context_budget_chars: None,
            retrieval_timeout: Duration::from_secs(5),
            latency_warning: Duration::from_secs(2),
            storage_timeout: Duration::from_secs(30),
            create_collections: true,
            server_port: 8430,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Build a config from `STORY_MEMORY_*` variables, falling back to defaults.
    ///
    /// `PROJECT_ID` sets the work-group, matching the hook scripts that call us.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("STORY_MEMORY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_var("STORY_MEMORY_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(embedder) = env_var("STORY_MEMORY_EMBEDDER") {
            config.embedder = embedder.parse()?;
        }
        if let Some(model) = env_var("STORY_MEMORY_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(group_id) = env_var("PROJECT_ID") {
            config.group_id = group_id;
        }
        if let Some(group) = env_var("STORY_MEMORY_BEST_PRACTICES_GROUP") {
            config.best_practices_group = group;
        }
        if let Some(chars) = env_var("STORY_MEMORY_MAX_SHARD_CHARS") {
            config.max_shard_chars = parse_var("STORY_MEMORY_MAX_SHARD_CHARS", &chars)?;
        }
        if let Some(limit) = env_var("STORY_MEMORY_MAX_RESULTS") {
            config.max_retrieval_results = parse_var("STORY_MEMORY_MAX_RESULTS", &limit)?;
        }
        if let Some(score) = env_var("STORY_MEMORY_MIN_SCORE") {
            config.min_similarity_score = parse_var("STORY_MEMORY_MIN_SCORE", &score)?;
        }
        if let Some(score) = env_var("STORY_MEMORY_ARCHITECTURE_MIN_SCORE") {
            config.architecture_min_score =
                parse_var("STORY_MEMORY_ARCHITECTURE_MIN_SCORE", &score)?;
        }
        if let Some(budget) = env_var("STORY_MEMORY_CONTEXT_BUDGET_CHARS") {
            config.context_budget_chars =
                Some(parse_var("STORY_MEMORY_CONTEXT_BUDGET_CHARS", &budget)?);
        }
        if let Some(ms) = env_var("STORY_MEMORY_RETRIEVAL_TIMEOUT_MS") {
            config.retrieval_timeout =
                Duration::from_millis(parse_var("STORY_MEMORY_RETRIEVAL_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = env_var("STORY_MEMORY_STORAGE_TIMEOUT_MS") {
            config.storage_timeout =
                Duration::from_millis(parse_var("STORY_MEMORY_STORAGE_TIMEOUT_MS", &ms)?);
        }
        if let Some(port) = env_var("STORY_MEMORY_PORT") {
            config.server_port = parse_var("STORY_MEMORY_PORT", &port)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_shard_chars < 64 {
            return Err(Error::config(format!(
                "max_shard_chars must be at least 64, got {}",
                self.max_shard_chars
            )));
        }
        if self.max_retrieval_results == 0 {
            return Err(Error::config("max_retrieval_results must be positive"));
        }
        if self.group_id.trim().is_empty() {
            return Err(Error::config("group_id must not be empty"));
        }
        if self.latency_warning > self.retrieval_timeout {
            return Err(Error::config(
                "latency_warning must not exceed retrieval_timeout",
            ));
        }
        Ok(())
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} has an invalid value `{}`", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_shards() {
        let config = Config {
            max_shard_chars: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_warning_above_timeout() {
        let config = Config {
            latency_warning: Duration::from_secs(10),
            retrieval_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_backend_and_embedder_names() {
        assert_eq!("LanceDB".parse::<BackendKind>().unwrap(), BackendKind::Lance);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("hash".parse::<EmbedderKind>().unwrap(), EmbedderKind::Hash);
        assert!("qdrant".parse::<BackendKind>().is_err());
    }

    #[test]
    fn vector_path_lives_under_data_dir() {
        let config = Config::with_data_dir("/tmp/story-memory-test");
        assert_eq!(
            config.vector_db_path(),
            PathBuf::from("/tmp/story-memory-test/vectors")
        );
    }
}
